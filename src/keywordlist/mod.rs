//! Ordered key -> string store used to persist sensor models.
//!
//! Every numeric field is written as text under a caller supplied prefix, e.g.
//! `image0.adjustment_0.adj_param_3.sigma`. The store knows nothing about the
//! meaning of the keys; typed getters parse on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs;
use std::io::Write;
use std::str::FromStr;
use yaml_rust::{Yaml, YamlLoader};

#[derive(thiserror::Error, Debug)]
pub enum KeywordListError {
    #[error("Missing keyword: {0}")]
    MissingKeyword(String),
    #[error("Failed to parse keyword {key}: '{value}'")]
    ParseError { key: String, value: String },
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for KeywordListError {
    fn from(err: std::io::Error) -> Self {
        KeywordListError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for KeywordListError {
    fn from(err: yaml_rust::ScanError) -> Self {
        KeywordListError::YamlError(err.to_string())
    }
}

/// Joins a prefix and a keyword with a single `.` separator.
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else if prefix.ends_with('.') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}.{name}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordList {
    entries: BTreeMap<String, String>,
}

impl KeywordList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn save(&mut self, key: &str, value: impl Display) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Saves `value` under `prefix` + `name`.
    pub fn save_with_prefix(&mut self, prefix: &str, name: &str, value: impl Display) {
        self.save(&join_key(prefix, name), value);
    }

    /// Stores a list of numbers as one space separated value.
    pub fn save_f64_list(&mut self, key: &str, values: &[f64]) {
        let text = values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        self.save(key, text);
    }

    pub fn find(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Removes every keyword that starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn require(&self, key: &str) -> Result<&str, KeywordListError> {
        self.find(key)
            .ok_or_else(|| KeywordListError::MissingKeyword(key.to_string()))
    }

    /// Parses a required keyword into any `FromStr` type.
    pub fn get<T: FromStr>(&self, key: &str) -> Result<T, KeywordListError> {
        let value = self.require(key)?;
        value
            .trim()
            .parse::<T>()
            .map_err(|_| KeywordListError::ParseError {
                key: key.to_string(),
                value: value.to_string(),
            })
    }

    /// Parses an optional keyword, returning `default` when it is absent.
    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, KeywordListError> {
        if self.contains(key) {
            self.get(key)
        } else {
            Ok(default)
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, KeywordListError> {
        self.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, KeywordListError> {
        let value = self.require(key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(KeywordListError::ParseError {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn get_f64_list(&self, key: &str) -> Result<Vec<f64>, KeywordListError> {
        let value = self.require(key)?;
        value
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|_| KeywordListError::ParseError {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .collect()
    }

    /// All keywords that start with `prefix`, in key order.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k)
    }

    /// Copies every entry of `other` into `self`, overwriting duplicates.
    pub fn merge(&mut self, other: &KeywordList) {
        for (k, v) in other.iter() {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn to_yaml_string(&self) -> Result<String, KeywordListError> {
        let mapping = serde_yaml::Mapping::from_iter(self.entries.iter().map(|(k, v)| {
            (
                serde_yaml::Value::String(k.clone()),
                serde_yaml::Value::String(v.clone()),
            )
        }));
        serde_yaml::to_string(&mapping).map_err(|e| KeywordListError::YamlError(e.to_string()))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, KeywordListError> {
        let docs = YamlLoader::load_from_str(contents)?;
        let mut kwl = KeywordList::new();
        let Some(doc) = docs.first() else {
            return Ok(kwl);
        };
        let hash = doc.as_hash().ok_or_else(|| {
            KeywordListError::YamlError("top level must be a mapping".to_string())
        })?;
        for (key, value) in hash {
            let key = yaml_scalar(key).ok_or_else(|| {
                KeywordListError::YamlError(format!("unsupported key {key:?}"))
            })?;
            let value = yaml_scalar(value).ok_or_else(|| {
                KeywordListError::YamlError(format!("unsupported value for {key}"))
            })?;
            kwl.entries.insert(key, value);
        }
        Ok(kwl)
    }

    /// Saves the keyword list as a flat YAML mapping.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), KeywordListError> {
        let yaml_string = self.to_yaml_string()?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    pub fn load_from_yaml(path: &str) -> Result<Self, KeywordListError> {
        let contents = fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

fn yaml_scalar(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Real(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Boolean(b) => Some(b.to_string()),
        Yaml::Null => Some(String::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut kwl = KeywordList::new();
        kwl.save("image0.line_offset", 2048.5);
        kwl.save("image0.locked", true);
        kwl.save_f64_list("image0.coeffs", &[1.0, -2.5e-7, 3.25]);

        assert_eq!(kwl.get_f64("image0.line_offset").unwrap(), 2048.5);
        assert!(kwl.get_bool("image0.locked").unwrap());
        assert_eq!(
            kwl.get_f64_list("image0.coeffs").unwrap(),
            vec![1.0, -2.5e-7, 3.25]
        );
        assert_eq!(kwl.get_or("image0.missing", 7usize).unwrap(), 7);
        assert!(matches!(
            kwl.get_f64("image1.line_offset"),
            Err(KeywordListError::MissingKeyword(_))
        ));
    }

    #[test]
    fn test_parse_error_names_key() {
        let mut kwl = KeywordList::new();
        kwl.save("sigma", "abc");
        match kwl.get_f64("sigma") {
            Err(KeywordListError::ParseError { key, value }) => {
                assert_eq!(key, "sigma");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_prefix_queries() {
        let mut kwl = KeywordList::new();
        kwl.save("a.x", 1);
        kwl.save("a.y", 2);
        kwl.save("b.x", 3);
        let keys: Vec<_> = kwl.keys_with_prefix("a.").cloned().collect();
        assert_eq!(keys, vec!["a.x".to_string(), "a.y".to_string()]);
        kwl.remove_prefix("a.");
        assert_eq!(kwl.len(), 1);
        assert_eq!(join_key("image0", "type"), "image0.type");
        assert_eq!(join_key("image0.", "type"), "image0.type");
        assert_eq!(join_key("", "type"), "type");
    }

    #[test]
    fn test_yaml_round_trip() {
        let mut kwl = KeywordList::new();
        kwl.save("type", "rpc");
        kwl.save("line_scale", 0.1 + 0.2);
        kwl.save("description", "intrack offset");
        let text = kwl.to_yaml_string().unwrap();
        let loaded = KeywordList::from_yaml_str(&text).unwrap();
        assert_eq!(loaded, kwl);
        assert_eq!(loaded.get_f64("line_scale").unwrap(), 0.1 + 0.2);
    }

    #[test]
    fn test_load_native_yaml_scalars() {
        let text = "type: frame\nfocal_length: 0.1\nmax_iterations: 20\nlocked: false\n";
        let kwl = KeywordList::from_yaml_str(text).unwrap();
        assert_eq!(kwl.find("type"), Some("frame"));
        assert_eq!(kwl.get_f64("focal_length").unwrap(), 0.1);
        assert_eq!(kwl.get::<usize>("max_iterations").unwrap(), 20);
        assert!(!kwl.get_bool("locked").unwrap());
    }
}
