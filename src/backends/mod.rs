// Backend ranking shared by the pluggable OS integrations

pub mod socket_mapper;

/// Backend priority ranking (higher = better)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackendPriority {
    Fallback = 1, // Works but slow or incomplete
    Good = 2,     // Solid, but spawns an external process
    Better = 3,
    Best = 4, // Native kernel interface
}

impl std::fmt::Display for BackendPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BackendPriority::Fallback => "fallback",
            BackendPriority::Good => "good",
            BackendPriority::Better => "better",
            BackendPriority::Best => "best",
        };
        f.write_str(label)
    }
}

/// Capabilities that a backend supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    pub ipv4_support: bool,
    pub ipv6_support: bool,
    /// Can name the owning process of a socket
    pub per_process: bool,
    /// Reports full local/remote endpoints, not just listening ports
    pub per_connection: bool,
}
