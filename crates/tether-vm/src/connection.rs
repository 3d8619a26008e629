use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Socket,
    SharedMemory,
}

/// Debug-wire connection descriptor (`-agentlib:jdwp=transport=...,address=...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConnection {
    pub transport: Transport,
    pub host: Option<String>,
    pub address: String,
    /// `true` when the debugger listens and the VM connects to it.
    pub server_mode: bool,
}

impl RemoteConnection {
    pub fn socket(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: Transport::Socket,
            host: Some(host.into()),
            address: port.to_string(),
            server_mode: false,
        }
    }

    pub fn listening(port: u16) -> Self {
        Self {
            transport: Transport::Socket,
            host: None,
            address: port.to_string(),
            server_mode: true,
        }
    }

    pub fn shared_memory(name: impl Into<String>) -> Self {
        Self {
            transport: Transport::SharedMemory,
            host: None,
            address: name.into(),
            server_mode: false,
        }
    }

    pub fn address_display_name(&self) -> String {
        match (&self.transport, &self.host) {
            (Transport::Socket, Some(host)) if !host.is_empty() => {
                format!("{host}:{}", self.address)
            }
            _ => self.address.clone(),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            Transport::Socket => "socket",
            Transport::SharedMemory => "shared memory",
        }
    }
}

impl fmt::Display for RemoteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "address: '{}', transport: '{}'",
            self.address_display_name(),
            self.transport_name()
        )
    }
}
