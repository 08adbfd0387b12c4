//! Where the coordination service lives.

/// Coordination backend selected by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coordinator {
    /// In-process coordinator; single instance only.
    Memory,

    /// Consul agent at this address.
    Consul(String),
}

impl Coordinator {
    /// `memory` selects the in-process coordinator; anything else is taken
    /// as a Consul address.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "memory" => Self::Memory,
            addr => Self::Consul(addr.to_string()),
        }
    }
}
