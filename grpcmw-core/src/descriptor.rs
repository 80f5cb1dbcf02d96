//! Service descriptors: the names a chain or bridge is built for.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl StreamKind {
    pub fn is_unary(&self) -> bool {
        matches!(self, StreamKind::Unary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Unary => "unary",
            StreamKind::ServerStreaming => "server_streaming",
            StreamKind::ClientStreaming => "client_streaming",
            StreamKind::BidiStreaming => "bidi_streaming",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub kind: StreamKind,
}

/// A named RPC service and its methods, in registration order.
///
/// ```
/// use grpcmw_core::{ServiceDescriptor, StreamKind};
///
/// let svc = ServiceDescriptor::new("pkg.Greeter")
///     .with_method("SayHello", StreamKind::Unary)
///     .with_method("Chat", StreamKind::BidiStreaming);
///
/// assert_eq!(svc.endpoints(), vec!["/pkg.Greeter/SayHello", "/pkg.Greeter/Chat"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Append a method. A repeated name replaces the earlier kind in place.
    pub fn with_method(mut self, name: impl Into<String>, kind: StreamKind) -> Self {
        let name = name.into();
        match self.methods.iter_mut().find(|m| m.name == name) {
            Some(existing) => existing.kind = kind,
            None => self.methods.push(MethodDescriptor { name, kind }),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Externally addressable paths, `/<service>/<method>`, in method order.
    pub fn endpoints(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|m| format!("/{}/{}", self.name, m.name))
            .collect()
    }

    /// Split a request path into its method, if it addresses this service.
    pub fn method_for_path(&self, path: &str) -> Option<&MethodDescriptor> {
        let rest = path.strip_prefix('/')?.strip_prefix(self.name.as_str())?;
        self.method(rest.strip_prefix('/')?)
    }
}
