//! Capture filter expressions.
//!
//! A userspace subset of the pcap-filter language, evaluated against frames
//! after header decoding:
//!
//! ```text
//! tcp | udp | icmp | icmp6 | ip | ip6
//! [src|dst] port N        [src|dst] portrange N-M
//! [src|dst] host ADDR     [src|dst] net ADDR/LEN
//! less N | greater N | proto N | ip proto N
//! tcp port 80 | udp dst port 53
//! not X | X and Y | X or Y | ( X )     (also !, &&, ||)
//! ```
//!
//! `not` binds tightest. `and` and `or` share one precedence level and
//! associate left to right, so `tcp or udp and port 53` reads as
//! `(tcp or udp) and port 53`. The empty expression matches every frame.
//!
//! Frames that are not IP can still be tested: every primitive except
//! `less` and `greater` is false for them.

use crate::capture::decode::DecodedFrame;
use crate::error::SnifferError;
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::value,
};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    ParenOpen,
    ParenClose,
    Word(String),
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '/' | '-' | '_')
}

fn symbol(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::And, tag("&&")),
        value(Token::Or, tag("||")),
        value(Token::Not, char('!')),
        value(Token::ParenOpen, char('(')),
        value(Token::ParenClose, char(')')),
    ))
    .parse(input)
}

fn word(input: &str) -> IResult<&str, Token> {
    let scanned: IResult<&str, &str> = take_while1(is_word_char).parse(input);
    let (input, w) = scanned?;
    let token = match w {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        _ => Token::Word(w.to_string()),
    };
    Ok((input, token))
}

fn tokenize(input: &str) -> Result<Vec<Token>, SnifferError> {
    let mut tokens = Vec::new();
    let mut remaining = input;

    loop {
        let (rest, _) = multispace0::<&str, nom::error::Error<&str>>(remaining)
            .map_err(|e| SnifferError::InvalidFilter(format!("lexer error: {e}")))?;
        remaining = rest;

        if remaining.is_empty() {
            break;
        }

        let (rest, token) = alt((symbol, word)).parse(remaining).map_err(|_| {
            SnifferError::InvalidFilter(format!(
                "unexpected character at \"{}\"",
                remaining.chars().take(20).collect::<String>()
            ))
        })?;
        tokens.push(token);
        remaining = rest;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Src,
    Dst,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtoMatch {
    Tcp,
    Udp,
    Icmp,
    Icmp6,
    Ip,
    Ip6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Primitive {
    Proto(ProtoMatch),
    IpProto(u8),
    PortRange(Dir, u16, u16),
    Host(Dir, IpAddr),
    Net(Dir, IpAddr, u8),
    Less(usize),
    Greater(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Primitive(Primitive),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A compiled capture filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketFilter {
    expr: Option<Expr>,
}

impl PacketFilter {
    /// Compile a filter expression.
    ///
    /// Fails with [`SnifferError::InvalidFilter`] on any syntax error,
    /// unknown primitive or out-of-range number.
    pub fn compile(source: &str) -> Result<Self, SnifferError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Ok(Self { expr: None });
        }

        let mut cursor = TokenCursor::new(&tokens);
        let expr = cursor.parse_expr()?;
        if let Some(tok) = cursor.peek() {
            return Err(filter_err(format!("unexpected token {tok:?}")));
        }

        Ok(Self { expr: Some(expr) })
    }

    pub fn matches(&self, frame: &DecodedFrame) -> bool {
        match &self.expr {
            Some(expr) => eval(expr, Some(frame), frame.length),
            None => true,
        }
    }

    /// Whether a frame with no decodable IP header of `length` bytes passes
    pub fn matches_undecodable(&self, length: usize) -> bool {
        match &self.expr {
            Some(expr) => eval(expr, None, length),
            None => true,
        }
    }
}

fn prim(primitive: Primitive) -> Result<Expr, SnifferError> {
    Ok(Expr::Primitive(primitive))
}

fn filter_err(message: String) -> SnifferError {
    SnifferError::InvalidFilter(message)
}

struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_word(&self) -> Option<&str> {
        match self.peek() {
            Some(Token::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_word(&mut self, what: &str) -> Result<String, SnifferError> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w.clone()),
            other => Err(filter_err(format!("expected {what}, got {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, SnifferError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let and = match self.peek() {
                Some(Token::And) => true,
                Some(Token::Or) => false,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = if and {
                Expr::And(Box::new(lhs), Box::new(rhs))
            } else {
                Expr::Or(Box::new(lhs), Box::new(rhs))
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, SnifferError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, SnifferError> {
        match self.advance().cloned() {
            Some(Token::ParenOpen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::ParenClose) => Ok(inner),
                    other => Err(filter_err(format!("expected ')', got {other:?}"))),
                }
            }
            Some(Token::Word(w)) => self.parse_primitive(&w),
            other => Err(filter_err(format!("expected a primitive, got {other:?}"))),
        }
    }

    fn parse_primitive(&mut self, w: &str) -> Result<Expr, SnifferError> {
        match w {
            "tcp" | "udp" => {
                let proto = if w == "tcp" {
                    ProtoMatch::Tcp
                } else {
                    ProtoMatch::Udp
                };
                // "tcp port 80" is shorthand for "tcp and port 80"
                if matches!(
                    self.peek_word(),
                    Some("port" | "portrange" | "src" | "dst")
                ) {
                    let next = self.expect_word("port qualifier")?;
                    let rest = self.parse_primitive(&next)?;
                    Ok(Expr::And(
                        Box::new(Expr::Primitive(Primitive::Proto(proto))),
                        Box::new(rest),
                    ))
                } else {
                    prim(Primitive::Proto(proto))
                }
            }
            "icmp" => prim(Primitive::Proto(ProtoMatch::Icmp)),
            "icmp6" => prim(Primitive::Proto(ProtoMatch::Icmp6)),
            "ip" | "ip6" => {
                let proto = if w == "ip" {
                    ProtoMatch::Ip
                } else {
                    ProtoMatch::Ip6
                };
                if self.peek_word() == Some("proto") {
                    self.advance();
                    let n = self.parse_number::<u8>("protocol number")?;
                    Ok(Expr::And(
                        Box::new(Expr::Primitive(Primitive::Proto(proto))),
                        Box::new(Expr::Primitive(Primitive::IpProto(n))),
                    ))
                } else {
                    prim(Primitive::Proto(proto))
                }
            }
            "proto" => {
                let n = self.parse_number::<u8>("protocol number")?;
                prim(Primitive::IpProto(n))
            }
            "less" => {
                let n = self.parse_number::<usize>("length")?;
                prim(Primitive::Less(n))
            }
            "greater" => {
                let n = self.parse_number::<usize>("length")?;
                prim(Primitive::Greater(n))
            }
            "src" | "dst" => {
                let dir = if w == "src" { Dir::Src } else { Dir::Dst };
                let qualifier = self.expect_word("port, portrange, host or net")?;
                self.parse_directional(dir, &qualifier)
            }
            "port" | "portrange" | "host" | "net" => self.parse_directional(Dir::Either, w),
            other => Err(filter_err(format!("unknown primitive '{other}'"))),
        }
    }

    fn parse_directional(&mut self, dir: Dir, qualifier: &str) -> Result<Expr, SnifferError> {
        let arg = self.expect_word(qualifier)?;
        let primitive = match qualifier {
            "port" => {
                let port = parse_port(&arg)?;
                Primitive::PortRange(dir, port, port)
            }
            "portrange" => {
                let (lo, hi) = arg
                    .split_once('-')
                    .ok_or_else(|| filter_err(format!("invalid port range '{arg}'")))?;
                let (lo, hi) = (parse_port(lo)?, parse_port(hi)?);
                if lo > hi {
                    return Err(filter_err(format!("invalid port range '{arg}'")));
                }
                Primitive::PortRange(dir, lo, hi)
            }
            "host" => {
                let addr: IpAddr = arg
                    .parse()
                    .map_err(|_| filter_err(format!("invalid host address '{arg}'")))?;
                Primitive::Host(dir, addr)
            }
            "net" => {
                let (addr, len) = parse_net(&arg)?;
                Primitive::Net(dir, addr, len)
            }
            other => {
                return Err(filter_err(format!(
                    "expected port, portrange, host or net, got '{other}'"
                )));
            }
        };
        Ok(Expr::Primitive(primitive))
    }

    fn parse_number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, SnifferError> {
        let w = self.expect_word(what)?;
        w.parse()
            .map_err(|_| filter_err(format!("invalid {what} '{w}'")))
    }
}

fn parse_port(s: &str) -> Result<u16, SnifferError> {
    s.parse()
        .map_err(|_| filter_err(format!("invalid port '{s}'")))
}

fn parse_net(s: &str) -> Result<(IpAddr, u8), SnifferError> {
    let (addr, len) = match s.split_once('/') {
        Some((addr, len)) => (addr, Some(len)),
        None => (s, None),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| filter_err(format!("invalid network '{s}'")))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let len = match len {
        Some(len) => len
            .parse::<u8>()
            .ok()
            .filter(|l| *l <= max)
            .ok_or_else(|| filter_err(format!("invalid prefix length in '{s}'")))?,
        None => max,
    };
    Ok((addr, len))
}

fn in_net(addr: IpAddr, net: IpAddr, len: u8) -> bool {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len as u32) };
            (u32::from(a) & mask) == (u32::from(n) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let mask = if len == 0 {
                0
            } else {
                u128::MAX << (128 - len as u32)
            };
            (u128::from(a) & mask) == (u128::from(n) & mask)
        }
        _ => false,
    }
}

fn dir_matches(dir: Dir, src: bool, dst: bool) -> bool {
    match dir {
        Dir::Src => src,
        Dir::Dst => dst,
        Dir::Either => src || dst,
    }
}

fn eval(expr: &Expr, frame: Option<&DecodedFrame>, length: usize) -> bool {
    match expr {
        Expr::Not(inner) => !eval(inner, frame, length),
        Expr::And(a, b) => eval(a, frame, length) && eval(b, frame, length),
        Expr::Or(a, b) => eval(a, frame, length) || eval(b, frame, length),
        Expr::Primitive(p) => eval_primitive(p, frame, length),
    }
}

fn eval_primitive(primitive: &Primitive, frame: Option<&DecodedFrame>, length: usize) -> bool {
    match (primitive, frame) {
        (Primitive::Less(n), _) => length <= *n,
        (Primitive::Greater(n), _) => length >= *n,
        // Non-IP frames fail every header test
        (_, None) => false,
        (Primitive::Proto(proto), Some(frame)) => match proto {
            ProtoMatch::Tcp => frame.protocol_number() == 6,
            ProtoMatch::Udp => frame.protocol_number() == 17,
            ProtoMatch::Icmp => frame.is_ipv4() && frame.protocol_number() == 1,
            ProtoMatch::Icmp6 => !frame.is_ipv4() && frame.protocol_number() == 58,
            ProtoMatch::Ip => frame.is_ipv4(),
            ProtoMatch::Ip6 => !frame.is_ipv4(),
        },
        (Primitive::IpProto(n), Some(frame)) => frame.protocol_number() == *n,
        (Primitive::PortRange(dir, lo, hi), Some(frame)) => match frame.ports() {
            Some((src, dst)) => {
                let in_range = |p: u16| p >= *lo && p <= *hi;
                dir_matches(*dir, in_range(src), in_range(dst))
            }
            None => false,
        },
        (Primitive::Host(dir, addr), Some(frame)) => dir_matches(
            *dir,
            frame.source() == *addr,
            frame.destination() == *addr,
        ),
        (Primitive::Net(dir, net, len), Some(frame)) => dir_matches(
            *dir,
            in_net(frame.source(), *net, *len),
            in_net(frame.destination(), *net, *len),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decode::{Datagram, Transport};

    fn udp(src: &str, sport: u16, dst: &str, dport: u16, length: usize) -> DecodedFrame {
        DecodedFrame {
            datagram: Datagram::V4 {
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                transport: Transport::Udp {
                    src_port: sport,
                    dst_port: dport,
                },
            },
            length,
        }
    }

    fn tcp6(src: &str, sport: u16, dst: &str, dport: u16) -> DecodedFrame {
        DecodedFrame {
            datagram: Datagram::V6 {
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                transport: Transport::Tcp {
                    src_port: sport,
                    dst_port: dport,
                },
            },
            length: 90,
        }
    }

    fn icmp(src: &str, dst: &str) -> DecodedFrame {
        DecodedFrame {
            datagram: Datagram::V4 {
                src: src.parse().unwrap(),
                dst: dst.parse().unwrap(),
                transport: Transport::Other(1),
            },
            length: 98,
        }
    }

    #[test]
    fn test_tokenize_symbols_and_words() {
        let tokens = tokenize("(tcp&&!udp)||port 80").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::ParenOpen,
                Token::Word("tcp".into()),
                Token::And,
                Token::Not,
                Token::Word("udp".into()),
                Token::ParenClose,
                Token::Or,
                Token::Word("port".into()),
                Token::Word("80".into()),
            ]
        );
    }

    #[test]
    fn test_default_filter() {
        let filter = PacketFilter::compile("tcp or udp").unwrap();
        assert!(filter.matches(&udp("10.0.0.2", 5000, "10.0.0.1", 80, 60)));
        assert!(filter.matches(&tcp6("fe80::1", 443, "fe80::2", 5555)));
        assert!(!filter.matches(&icmp("10.0.0.2", "10.0.0.1")));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = PacketFilter::compile("   ").unwrap();
        assert!(filter.matches(&icmp("10.0.0.2", "10.0.0.1")));
    }

    #[test]
    fn test_port_and_direction() {
        let frame = udp("10.0.0.2", 5000, "10.0.0.1", 80, 60);
        assert!(PacketFilter::compile("port 80").unwrap().matches(&frame));
        assert!(PacketFilter::compile("dst port 80").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("src port 80").unwrap().matches(&frame));
        assert!(PacketFilter::compile("udp src port 5000").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("tcp port 80").unwrap().matches(&frame));
        assert!(
            PacketFilter::compile("portrange 4000-6000")
                .unwrap()
                .matches(&frame)
        );
        assert!(
            !PacketFilter::compile("port 80")
                .unwrap()
                .matches(&icmp("10.0.0.2", "10.0.0.1"))
        );
    }

    #[test]
    fn test_host_and_net() {
        let frame = udp("10.0.0.2", 5000, "192.168.1.7", 53, 80);
        assert!(PacketFilter::compile("host 10.0.0.2").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("dst host 10.0.0.2").unwrap().matches(&frame));
        assert!(PacketFilter::compile("net 192.168.0.0/16").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("src net 192.168.0.0/16").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("net fe80::/10").unwrap().matches(&frame));
        assert!(
            PacketFilter::compile("net fe80::/10")
                .unwrap()
                .matches(&tcp6("fe80::1", 1, "fe80::2", 2))
        );
    }

    #[test]
    fn test_precedence_and_grouping() {
        let frame = udp("10.0.0.2", 5000, "10.0.0.1", 53, 60);
        assert!(PacketFilter::compile("tcp or udp and port 53").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("(tcp or udp) and not port 53").unwrap().matches(&frame));
        // and/or associate left to right with equal weight
        let web = udp("10.0.0.2", 40000, "10.0.0.1", 80, 60);
        assert!(!PacketFilter::compile("udp or tcp and port 53").unwrap().matches(&web));
        assert!(PacketFilter::compile("port 53 and tcp or udp").unwrap().matches(&web));
        assert!(PacketFilter::compile("port 53 and (tcp or udp)").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("port 53 and (tcp or udp)").unwrap().matches(&web));
        assert!(PacketFilter::compile("not tcp").unwrap().matches(&frame));
        assert!(PacketFilter::compile("! (ip6 || icmp)").unwrap().matches(&frame));
    }

    #[test]
    fn test_length_and_proto() {
        let frame = udp("10.0.0.2", 5000, "10.0.0.1", 53, 60);
        assert!(PacketFilter::compile("less 60").unwrap().matches(&frame));
        assert!(!PacketFilter::compile("greater 61").unwrap().matches(&frame));
        assert!(PacketFilter::compile("ip proto 17").unwrap().matches(&frame));
        assert!(PacketFilter::compile("proto 1").unwrap().matches(&icmp("1.1.1.1", "2.2.2.2")));
        assert!(PacketFilter::compile("icmp").unwrap().matches(&icmp("1.1.1.1", "2.2.2.2")));
    }

    #[test]
    fn test_non_ip_frames() {
        assert!(PacketFilter::compile("").unwrap().matches_undecodable(42));
        assert!(!PacketFilter::compile("tcp port 443").unwrap().matches_undecodable(42));
        assert!(!PacketFilter::compile("tcp or udp").unwrap().matches_undecodable(42));
        assert!(PacketFilter::compile("not tcp").unwrap().matches_undecodable(42));
        assert!(PacketFilter::compile("udp or greater 40").unwrap().matches_undecodable(42));
        assert!(!PacketFilter::compile("udp or greater 43").unwrap().matches_undecodable(42));
    }

    #[test]
    fn test_multibyte_input_is_rejected_cleanly() {
        for bad in ["€€€€€€€€", "tcp and ééééééééééééé", "port 80 ∧ udp"] {
            assert!(matches!(
                PacketFilter::compile(bad),
                Err(SnifferError::InvalidFilter(_))
            ));
        }
    }

    #[test]
    fn test_invalid_filters() {
        for bad in [
            "tcp and",
            "port",
            "port 70000",
            "host not-an-address",
            "net 10.0.0.0/40",
            "portrange 9-1",
            "(tcp or udp",
            "tcp udp",
            "bogus",
            "tcp $ udp",
        ] {
            assert!(
                matches!(
                    PacketFilter::compile(bad),
                    Err(SnifferError::InvalidFilter(_))
                ),
                "expected '{}' to be rejected",
                bad
            );
        }
    }
}
