use crate::config::{LabelsConfig, Validatable};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid {channel} value on line {line}")]
    InvalidColor { channel: &'static str, line: usize },
    #[error("Invalid line format on line {line}: {content}")]
    InvalidLine { line: usize, content: String },
    #[error("Labels file contains no class names")]
    Empty,
    #[error("Invalid class names in model metadata: {0}")]
    InvalidMetadata(String),
}

/// Class-id to class-name table of the loaded model, either embedded in the
/// model or read from a labels file where the class-id is the line index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNames {
    names: Vec<String>,
}

impl ClassNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn load(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        let names = load_yolo_labels(&labels_cfg.get_path())?;
        if names.is_empty() {
            return Err(LabelsError::Empty);
        }
        tracing::info!("Loaded {} class names", names.len());
        Ok(Self { names })
    }

    /// Parses the `names` entry Ultralytics writes into exported models, a
    /// Python dict literal such as `{0: 'person', 1: "men's shoes"}`.
    pub fn from_model_metadata(raw: &str) -> Result<Self, LabelsError> {
        let invalid = |reason: &str| LabelsError::InvalidMetadata(reason.to_string());

        let body = raw
            .trim()
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| invalid("expected a `{id: name}` mapping"))?;

        let mut entries = BTreeMap::new();
        let mut rest = body.trim_start();
        while !rest.is_empty() {
            let (key, value) = rest
                .split_once(':')
                .ok_or_else(|| invalid("missing `:` after class id"))?;
            let class_id: usize = key
                .trim()
                .trim_matches(|c: char| c == '"' || c == '\'')
                .parse()
                .map_err(|_| invalid(&format!("invalid class id `{}`", key.trim())))?;

            let value = value.trim_start();
            let quote = value
                .chars()
                .next()
                .filter(|c| *c == '\'' || *c == '"')
                .ok_or_else(|| invalid(&format!("class {} has an unquoted name", class_id)))?;

            let mut name = String::new();
            let mut end = None;
            let mut chars = value[1..].char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            name.push(escaped);
                        }
                    }
                    c if c == quote => {
                        end = Some(i + 2);
                        break;
                    }
                    c => name.push(c),
                }
            }
            let end =
                end.ok_or_else(|| invalid(&format!("class {} has an unterminated name", class_id)))?;

            if entries.insert(class_id, name).is_some() {
                return Err(invalid(&format!("class {} is listed twice", class_id)));
            }

            rest = value[end..].trim_start();
            rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
        }

        if entries.is_empty() {
            return Err(LabelsError::Empty);
        }
        if entries.keys().copied().ne(0..entries.len()) {
            return Err(invalid("class ids are not contiguous from 0"));
        }

        Ok(Self::new(entries.into_values().collect()))
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ClassNames {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

/// Reads one class per line, either `name` or `name,red,green,blue`.
/// Blank lines may only trail the last class.
pub fn load_yolo_labels(filepath: &Path) -> Result<Vec<String>, LabelsError> {
    let file = File::open(filepath)?;
    parse_labels(io::BufReader::new(file))
}

fn parse_labels(reader: impl BufRead) -> Result<Vec<String>, LabelsError> {
    let mut labels = Vec::new();
    let mut blank_line = None;

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_number = index + 1;
        if line.trim().is_empty() {
            blank_line.get_or_insert(line_number);
            continue;
        }
        // class-ids are line indices, so only trailing blank lines are allowed
        if let Some(blank) = blank_line {
            return Err(LabelsError::InvalidLine {
                line: blank,
                content: String::new(),
            });
        }

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [label] if !label.is_empty() => labels.push(label.to_string()),
            [label, red, green, blue] if !label.is_empty() => {
                for (channel, value) in [("red", red), ("green", green), ("blue", blue)] {
                    value.parse::<u8>().map_err(|_| LabelsError::InvalidColor {
                        channel,
                        line: line_number,
                    })?;
                }
                labels.push(label.to_string());
            }
            _ => {
                return Err(LabelsError::InvalidLine {
                    line: line_number,
                    content: line.clone(),
                })
            }
        }
    }

    Ok(labels)
}
