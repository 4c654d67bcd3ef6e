//! Interface and delegate shapes.
//!
//! Shapes describe what a remote object exposes. They travel inside
//! `Wrapped` descriptors so the receiving side can build a proxy without
//! any compile-time knowledge of the object, and members are addressed by
//! stable `(interface, member)` names resolved against them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a parameter flows between caller and callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamMode {
    #[default]
    In,
    /// Written by the callee and copied back to the caller.
    Out,
    /// Passed in and copied back.
    Ref,
}

impl ParamMode {
    /// Whether the callee's value is returned to the caller.
    pub fn is_returned(self) -> bool {
        matches!(self, ParamMode::Out | ParamMode::Ref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamShape {
    pub name: String,
    #[serde(default)]
    pub mode: ParamMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodShape {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamShape>,
}

impl MethodShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(self, name: impl Into<String>) -> Self {
        self.param_with(name, ParamMode::In)
    }

    pub fn out_param(self, name: impl Into<String>) -> Self {
        self.param_with(name, ParamMode::Out)
    }

    pub fn ref_param(self, name: impl Into<String>) -> Self {
        self.param_with(name, ParamMode::Ref)
    }

    fn param_with(mut self, name: impl Into<String>, mode: ParamMode) -> Self {
        self.params.push(ParamShape {
            name: name.into(),
            mode,
        });
        self
    }

    /// Positions whose values are copied back to the caller.
    pub fn returned_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.mode.is_returned())
            .map(|(i, _)| i)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyShape {
    pub name: String,
    /// Readable from a snapshot taken when the object is first lent.
    #[serde(default)]
    pub cacheable: bool,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventShape {
    pub name: String,
    pub delegate: DelegateShape,
}

/// Signature of a callable delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateShape {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamShape>,
}

impl DelegateShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamShape {
            name: name.into(),
            mode: ParamMode::In,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceShape {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodShape>,
    #[serde(default)]
    pub properties: Vec<PropertyShape>,
    #[serde(default)]
    pub events: Vec<EventShape>,
}

impl InterfaceShape {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
            properties: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Add a method whose parameters are all inputs.
    pub fn method(self, name: &str, params: &[&str]) -> Self {
        let shape = params
            .iter()
            .fold(MethodShape::new(name), |m, p| m.param(*p));
        self.method_shape(shape)
    }

    pub fn method_shape(mut self, shape: MethodShape) -> Self {
        self.methods.push(shape);
        self
    }

    pub fn property(mut self, name: &str, writable: bool) -> Self {
        self.properties.push(PropertyShape {
            name: name.to_string(),
            cacheable: false,
            writable,
        });
        self
    }

    /// Add a property served from the proxy's snapshot.
    pub fn cached_property(mut self, name: &str, writable: bool) -> Self {
        self.properties.push(PropertyShape {
            name: name.to_string(),
            cacheable: true,
            writable,
        });
        self
    }

    pub fn event(mut self, name: &str, delegate: DelegateShape) -> Self {
        self.events.push(EventShape {
            name: name.to_string(),
            delegate,
        });
        self
    }

    pub fn find_method(&self, name: &str) -> Option<&MethodShape> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyShape> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn find_event(&self, name: &str) -> Option<&EventShape> {
        self.events.iter().find(|e| e.name == name)
    }
}

/// Stable identifier of a member: the declaring interface and member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberRef {
    pub interface: String,
    pub member: String,
}

impl MemberRef {
    pub fn new(interface: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.member)
    }
}

/// Kind of member being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Method,
    Property,
    Event,
}

/// Find the interface declaring `name` as a member of the given kind.
pub fn resolve_member(
    interfaces: &[InterfaceShape],
    kind: MemberKind,
    name: &str,
) -> Option<MemberRef> {
    interfaces.iter().find_map(|iface| {
        let found = match kind {
            MemberKind::Method => iface.find_method(name).is_some(),
            MemberKind::Property => iface.find_property(name).is_some(),
            MemberKind::Event => iface.find_event(name).is_some(),
        };
        found.then(|| MemberRef::new(&iface.name, name))
    })
}

/// Look up the interface a member reference points into.
pub fn find_interface<'a>(
    interfaces: &'a [InterfaceShape],
    member: &MemberRef,
) -> Option<&'a InterfaceShape> {
    interfaces.iter().find(|i| i.name == member.interface)
}
