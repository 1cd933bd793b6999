//! Rewrite configuration (`nativize.toml`).
//!
//! ```toml
//! dlopen-flags = 2
//! excluded-types = ["App.KeepDeclarative"]
//!
//! [helper-type]
//! namespace = "App.Interop"
//! name = "NativeLoader"
//!
//! [library-aliases]
//! m = "libm.so.6"
//! ```

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use nativize_model::TypeName;

use crate::error::{Result, RewriteError};

/// `RTLD_LAZY`
pub const DEFAULT_DLOPEN_FLAGS: i32 = 1;

/// Name of the generated helper type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HelperTypeConfig {
    pub namespace: String,
    pub name: String,
}

impl Default for HelperTypeConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: "PInvokeHelpers".to_string(),
        }
    }
}

/// Settings for one rewrite run. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RewriteConfig {
    pub helper_type: HelperTypeConfig,
    /// Flags passed to `dlopen` on Unix.
    pub dlopen_flags: i32,
    /// Declared library name -> name passed to the loader.
    pub library_aliases: IndexMap<String, String>,
    /// Declaring types (full names) whose stubs are left declarative.
    pub excluded_types: Vec<String>,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            helper_type: HelperTypeConfig::default(),
            dlopen_flags: DEFAULT_DLOPEN_FLAGS,
            library_aliases: IndexMap::new(),
            excluded_types: Vec::new(),
        }
    }
}

impl RewriteConfig {
    /// Parse and validate a configuration from TOML.
    pub fn parse(input: &str) -> Result<Self> {
        let config: RewriteConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.helper_type.name) {
            return Err(RewriteError::Config {
                detail: format!(
                    "helper-type.name '{}' is not a valid type name",
                    self.helper_type.name
                ),
            });
        }
        if !self.helper_type.namespace.is_empty()
            && !self.helper_type.namespace.split('.').all(is_identifier)
        {
            return Err(RewriteError::Config {
                detail: format!(
                    "helper-type.namespace '{}' is not a valid namespace",
                    self.helper_type.namespace
                ),
            });
        }
        if let Some((from, _)) = self
            .library_aliases
            .iter()
            .find(|(from, to)| from.is_empty() || to.is_empty())
        {
            return Err(RewriteError::Config {
                detail: format!("library alias for '{from}' must name a library"),
            });
        }
        Ok(())
    }

    pub fn helper_type_name(&self) -> TypeName {
        TypeName::new(&self.helper_type.namespace, &self.helper_type.name)
    }

    pub fn excluded_type_names(&self) -> Vec<TypeName> {
        self.excluded_types
            .iter()
            .map(|t| TypeName::parse(t))
            .collect()
    }

    /// Name handed to the loader for a declared library.
    pub fn load_name<'a>(&'a self, library: &'a str) -> &'a str {
        self.library_aliases
            .get(library)
            .map(String::as_str)
            .unwrap_or(library)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RewriteConfig::default();
        assert_eq!(config.dlopen_flags, 1);
        assert_eq!(config.helper_type_name().to_string(), "PInvokeHelpers");
        assert_eq!(config.load_name("m"), "m");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_file() {
        let config = RewriteConfig::parse(
            r#"
dlopen-flags = 258
excluded-types = ["App.Keep"]

[helper-type]
namespace = "App.Interop"
name = "NativeLoader"

[library-aliases]
m = "libm.so.6"
"#,
        )
        .unwrap();
        assert_eq!(config.dlopen_flags, 258);
        assert_eq!(
            config.helper_type_name().to_string(),
            "App.Interop.NativeLoader"
        );
        assert_eq!(config.load_name("m"), "libm.so.6");
        assert_eq!(config.load_name("libc"), "libc");
        assert_eq!(config.excluded_type_names(), vec![TypeName::parse("App.Keep")]);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = RewriteConfig::parse("[library-aliases]\nkernel = \"kernel32\"\n").unwrap();
        assert_eq!(config.dlopen_flags, DEFAULT_DLOPEN_FLAGS);
        assert_eq!(config.helper_type.name, "PInvokeHelpers");
    }

    #[test]
    fn invalid_helper_name_rejected() {
        let err = RewriteConfig::parse("[helper-type]\nname = \"9bad\"\n").unwrap_err();
        assert!(matches!(err, RewriteError::Config { .. }));
        let bad_namespace = "[helper-type]\nnamespace = \"a..b\"\nname = \"X\"\n";
        let err = RewriteConfig::parse(bad_namespace).unwrap_err();
        assert!(matches!(err, RewriteError::Config { .. }));
    }

    #[test]
    fn empty_alias_rejected() {
        let err = RewriteConfig::parse("[library-aliases]\nm = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("library alias for 'm'"));
    }

    #[test]
    fn malformed_toml_is_toml_error() {
        let err = RewriteConfig::parse("dlopen-flags = [").unwrap_err();
        assert!(matches!(err, RewriteError::Toml(_)));
    }
}
