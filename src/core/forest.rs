//! Tree registry (`forest.conf`)
//!
//! INI-style file mapping tree names to recipe tree locations:
//!
//! ```ini
//! [DEFAULT]
//! base = /var/lib/trees
//!
//! [default]
//! location = ${base}/aosc-os-abbs
//!
//! [bsp]
//! location = ${default:location}-bsp
//! ```
//!
//! Values may reference `${key}` in the same section (or `[DEFAULT]`) and
//! `${section:key}` in another section. `$$` is a literal `$`.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::config::defaults;
use crate::error::ForestError;

const DEFAULT_SECTION: &str = "DEFAULT";

fn syntax_error(path: &Path, line: usize, message: &str) -> ForestError {
    ForestError::Syntax {
        path: path.to_path_buf(),
        line,
        message: message.to_string(),
    }
}

/// Parsed registry
#[derive(Debug, Clone, Default)]
pub struct ForestConfig {
    defaults: IndexMap<String, String>,
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl ForestConfig {
    /// Read the registry at `path`
    pub fn load(path: &Path) -> Result<Self, ForestError> {
        if !path.is_file() {
            return Err(ForestError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ForestError::ReadFile {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&content, path)
    }

    /// Parse registry text; `path` is used in error messages
    pub fn parse(content: &str, path: &Path) -> Result<Self, ForestError> {
        let mut config = Self::default();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // indented lines continue the previous value
            if raw.starts_with([' ', '\t']) {
                if let (Some(key), Some(section)) = (&last_key, &current) {
                    let value = config
                        .section_mut(section)
                        .get_mut(key)
                        .ok_or_else(|| syntax_error(path, line_no, "dangling continuation line"))?;
                    value.push('\n');
                    value.push_str(trimmed);
                    continue;
                }
            }

            if let Some(header) = trimmed.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| syntax_error(path, line_no, "malformed section header"))?;
                if name != DEFAULT_SECTION {
                    config.sections.entry(name.to_string()).or_default();
                }
                current = Some(name.to_string());
                last_key = None;
                continue;
            }

            let section = current
                .clone()
                .ok_or_else(|| syntax_error(path, line_no, "key outside of any section"))?;
            let split = trimmed
                .find(['=', ':'])
                .ok_or_else(|| syntax_error(path, line_no, "expected 'key = value'"))?;
            let key = trimmed[..split].trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(syntax_error(path, line_no, "empty key"));
            }
            let value = trimmed[split + 1..].trim().to_string();
            config.section_mut(&section).insert(key.clone(), value);
            last_key = Some(key);
        }

        Ok(config)
    }

    fn section_mut(&mut self, name: &str) -> &mut IndexMap<String, String> {
        if name == DEFAULT_SECTION {
            &mut self.defaults
        } else {
            self.sections.entry(name.to_string()).or_default()
        }
    }

    /// Section names in file order, `[DEFAULT]` excluded
    pub fn sections(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    fn raw(&self, section: &str, key: &str) -> Option<&String> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .or_else(|| self.defaults.get(key))
    }

    /// Interpolated value of `key` in `section`
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>, ForestError> {
        let key = key.to_ascii_lowercase();
        match self.raw(section, &key) {
            Some(raw) => self.interpolate(section, &key, raw, 1).map(Some),
            None => Ok(None),
        }
    }

    fn interpolate(
        &self,
        section: &str,
        key: &str,
        raw: &str,
        depth: usize,
    ) -> Result<String, ForestError> {
        let fail = |message: String| ForestError::Interpolation {
            section: section.to_string(),
            key: key.to_string(),
            message,
        };
        if depth > defaults::MAX_INTERPOLATION_DEPTH {
            return Err(fail("recursion limit exceeded".to_string()));
        }

        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];
            if let Some(tail) = after.strip_prefix('$') {
                out.push('$');
                rest = tail;
            } else if let Some(body) = after.strip_prefix('{') {
                let end = body
                    .find('}')
                    .ok_or_else(|| fail("unterminated '${'".to_string()))?;
                let reference = &body[..end];
                let (ref_section, ref_key) = match reference.split_once(':') {
                    Some((s, k)) => (s, k.to_ascii_lowercase()),
                    None => (section, reference.to_ascii_lowercase()),
                };
                let value = self
                    .raw(ref_section, &ref_key)
                    .ok_or_else(|| fail(format!("'{reference}' is not defined")))?;
                out.push_str(&self.interpolate(ref_section, &ref_key, value, depth + 1)?);
                rest = &body[end + 1..];
            } else {
                return Err(fail("'$' must be followed by '$' or '{'".to_string()));
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Location of `tree`
    pub fn tree_location(&self, tree: &str) -> Result<PathBuf, ForestError> {
        if !self.sections.contains_key(tree) {
            return Err(ForestError::TreeNotFound {
                tree: tree.to_string(),
                defined: self.sections(),
            });
        }
        self.get(tree, "location")?
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| ForestError::MissingLocation {
                tree: tree.to_string(),
            })
    }
}

/// Location of `tree` as registered in `<conf_dir>/forest.conf`
pub fn get_tree_by_name(conf_dir: &Path, tree: &str) -> Result<PathBuf, ForestError> {
    ForestConfig::load(&conf_dir.join(defaults::FOREST_CONF))?.tree_location(tree)
}
