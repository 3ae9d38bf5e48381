//! Bundle descriptor (`component.xml`).
//!
//! ```xml
//! <component>
//!     <class>org.example.Echo</class>
//!     <subdomain>echo</subdomain>
//!     <name>Echo</name>
//!     <description>Replies with whatever it receives</description>
//!     <author>Example Inc.</author>
//!     <version>1.0</version>
//! </component>
//! ```
//!
//! `class` and `subdomain` are required; the rest is metadata.

use std::fs;
use std::path::Path;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::constants::BUNDLE_DESCRIPTOR;
use crate::error::{Error, Result};

/// Parsed `component.xml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleDescriptor {
    /// Entry class locating the component's code.
    pub class: String,
    /// Subdomain to bind.
    pub subdomain: String,
    /// Display name.
    pub name: Option<String>,
    /// Short description.
    pub description: Option<String>,
    /// Author.
    pub author: Option<String>,
    /// Version string.
    pub version: Option<String>,
}

impl BundleDescriptor {
    /// Read the descriptor of the bundle extracted at `dir`.
    pub fn read(bundle: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(BUNDLE_DESCRIPTOR);
        let xml = fs::read_to_string(&path).map_err(|e| Error::BundleDescriptor {
            bundle: bundle.to_string(),
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(bundle, &xml)
    }

    /// Parse descriptor XML; `bundle` is only used in error messages.
    pub fn parse(bundle: &str, xml: &str) -> Result<Self> {
        let fail = |reason: String| Error::BundleDescriptor {
            bundle: bundle.to_string(),
            reason,
        };

        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut descriptor = Self::default();
        let mut path: Vec<String> = Vec::new();
        let mut saw_root = false;

        loop {
            match reader.read_event().map_err(|e| fail(e.to_string()))? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if path.is_empty() {
                        if name != "component" {
                            return Err(fail(format!("root element is <{name}>, expected <component>")));
                        }
                        saw_root = true;
                    }
                    path.push(name);
                }
                Event::Empty(_) if path.is_empty() => {
                    return Err(fail("descriptor has no class or subdomain".into()));
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(t) if path.len() == 2 => {
                    let text = t.unescape().map_err(|e| fail(e.to_string()))?.into_owned();
                    descriptor.set(&path[1], text);
                }
                Event::CData(t) if path.len() == 2 => {
                    let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                    descriptor.set(&path[1], text);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !saw_root {
            return Err(fail("no <component> element".into()));
        }
        if descriptor.class.is_empty() {
            return Err(fail("missing <class>".into()));
        }
        if descriptor.subdomain.is_empty() {
            return Err(fail("missing <subdomain>".into()));
        }
        Ok(descriptor)
    }

    fn set(&mut self, field: &str, value: String) {
        let value = value.trim().to_string();
        match field {
            "class" => self.class = value,
            "subdomain" => self.subdomain = value,
            "name" => self.name = Some(value),
            "description" => self.description = Some(value),
            "author" => self.author = Some(value),
            "version" => self.version = Some(value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_descriptor() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <component>
                <class>org.example.Echo</class>
                <subdomain>echo</subdomain>
                <name>Echo &amp; Co</name>
                <description><![CDATA[Says <things> back]]></description>
                <author>Example</author>
                <version>1.2</version>
                <extra>ignored</extra>
            </component>"#;
        let d = BundleDescriptor::parse("echo", xml).unwrap();
        assert_eq!(d.class, "org.example.Echo");
        assert_eq!(d.subdomain, "echo");
        assert_eq!(d.name.as_deref(), Some("Echo & Co"));
        assert_eq!(d.description.as_deref(), Some("Says <things> back"));
        assert_eq!(d.author.as_deref(), Some("Example"));
        assert_eq!(d.version.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_metadata_is_optional() {
        let d = BundleDescriptor::parse(
            "echo",
            "<component><class>Echo</class><subdomain>echo</subdomain></component>",
        )
        .unwrap();
        assert_eq!(d.name, None);
        assert_eq!(d.version, None);
    }

    #[test]
    fn test_missing_subdomain_is_rejected() {
        let err = BundleDescriptor::parse("echo", "<component><class>Echo</class></component>")
            .unwrap_err();
        assert!(matches!(err, Error::BundleDescriptor { .. }));
        assert!(err.to_string().contains("subdomain"));
    }

    #[test]
    fn test_missing_class_is_rejected() {
        let err = BundleDescriptor::parse("echo", "<component><subdomain>echo</subdomain></component>")
            .unwrap_err();
        assert!(err.to_string().contains("class"));
    }

    #[test]
    fn test_wrong_root_is_rejected() {
        assert!(BundleDescriptor::parse("x", "<plugin><class>A</class></plugin>").is_err());
        assert!(BundleDescriptor::parse("x", "<component/>").is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundleDescriptor::read("echo", dir.path()).unwrap_err();
        assert!(matches!(err, Error::BundleDescriptor { .. }));
    }
}
