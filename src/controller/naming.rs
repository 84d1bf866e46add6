//! Destination naming for synced service instances

use crate::config::NamingConfig;

/// Name and namespace a source resource maps to in the mesh registry
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DestinationName {
    pub name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, Default)]
pub struct NameTranslator {
    config: NamingConfig,
}

impl NameTranslator {
    pub fn new(config: NamingConfig) -> Self {
        Self { config }
    }

    /// Compute the destination for a source resource.
    ///
    /// A non-empty `override_name` is used verbatim and suppresses both the
    /// prefix and the namespace suffix.
    pub fn translate(
        &self,
        source_name: &str,
        source_namespace: &str,
        override_name: Option<&str>,
    ) -> DestinationName {
        let name = match override_name.filter(|n| !n.is_empty()) {
            Some(explicit) => explicit.to_string(),
            None => {
                let mut name = format!("{}{}", self.config.service_prefix, source_name);
                if self.config.add_namespace_suffix {
                    name.push('-');
                    name.push_str(source_namespace);
                }
                name
            }
        };

        DestinationName {
            name,
            namespace: self.destination_namespace(source_namespace),
        }
    }

    /// Destination namespace for resources from `source_namespace`
    pub fn destination_namespace(&self, source_namespace: &str) -> String {
        if self.config.enable_namespace_mirroring {
            format!("{}{}", self.config.mirroring_prefix, source_namespace)
        } else {
            self.config.write_namespace.clone()
        }
    }
}
