//! Capability descriptors and discovery-result parsing.
//!
//! A capability is one tool, resource, or prompt advertised by a backend.
//! The payload describing it (`schema`) is preserved verbatim so the
//! composed listing can re-emit exactly what the backend advertised, with
//! only the public name rewritten.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a composed capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [
        CapabilityKind::Tool,
        CapabilityKind::Resource,
        CapabilityKind::Prompt,
    ];

    /// The `*/list` method used to discover this kind.
    pub fn list_method(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools/list",
            CapabilityKind::Resource => "resources/list",
            CapabilityKind::Prompt => "prompts/list",
        }
    }

    /// The key under which list results carry their entries.
    pub fn list_key(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tools",
            CapabilityKind::Resource => "resources",
            CapabilityKind::Prompt => "prompts",
        }
    }

    /// The field identifying an entry of this kind. Resources are keyed by
    /// uri; tools and prompts by name.
    pub fn id_field(&self) -> &'static str {
        match self {
            CapabilityKind::Resource => "uri",
            _ => "name",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityKind::Tool => write!(f, "tool"),
            CapabilityKind::Resource => write!(f, "resource"),
            CapabilityKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// One capability in the merged namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Name (or uri, for resources) as the owning backend advertised it.
    pub original_name: String,
    /// The managed server that contributed this capability.
    pub owning_server_id: String,
    /// Collision-resolved name visible to clients.
    pub qualified_name: String,
    pub kind: CapabilityKind,
    /// The backend's advertisement, verbatim.
    pub schema: Value,
}

impl CapabilityDescriptor {
    /// The advertisement with its identifying field rewritten to the
    /// qualified name, as it appears in composed list results.
    pub fn public_schema(&self) -> Value {
        let mut schema = self.schema.clone();
        if let Some(obj) = schema.as_object_mut() {
            obj.insert(
                self.kind.id_field().to_string(),
                Value::String(self.qualified_name.clone()),
            );
        }
        schema
    }
}

/// Capabilities discovered from one backend in a single pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<(String, Value)>,
    pub resources: Vec<(String, Value)>,
    pub prompts: Vec<(String, Value)>,
}

impl DiscoveredCapabilities {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.prompts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len() + self.resources.len() + self.prompts.len()
    }

    pub fn entries(&self, kind: CapabilityKind) -> &[(String, Value)] {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }

    /// Record one `*/list` result. Entries missing their identifying field
    /// are skipped.
    pub fn absorb_list_result(&mut self, kind: CapabilityKind, result: &Value) {
        let entries = result
            .get(kind.list_key())
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let bucket = match kind {
            CapabilityKind::Tool => &mut self.tools,
            CapabilityKind::Resource => &mut self.resources,
            CapabilityKind::Prompt => &mut self.prompts,
        };

        for entry in entries {
            match entry.get(kind.id_field()).and_then(|n| n.as_str()) {
                Some(name) => bucket.push((name.to_string(), entry.clone())),
                None => {
                    tracing::warn!("discovery entry without '{}' skipped", kind.id_field());
                }
            }
        }
    }
}
