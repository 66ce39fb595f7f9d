use image::Rgb;
use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

const DEFAULT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

/// Drawing colour per class label.
#[derive(Debug, Clone, Default)]
pub struct LabelPalette {
    colors: HashMap<String, Rgb<u8>>,
}

impl LabelPalette {
    pub fn load(path: &Path) -> Result<Self, LabelsError> {
        let file = File::open(path)?;
        Self::from_reader(io::BufReader::new(file))
    }

    /// Parses `label,red,green,blue` lines. Blank lines are skipped.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, LabelsError> {
        let mut colors = HashMap::new();

        for (index, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.split(',').collect();
            if parts.len() != 4 {
                return Err(LabelsError::InvalidLine {
                    line: index + 1,
                    reason: format!("expected `label,red,green,blue`, got `{}`", line),
                });
            }

            let channel = |value: &str, name: &str| {
                value
                    .trim()
                    .parse::<u8>()
                    .map_err(|_| LabelsError::InvalidLine {
                        line: index + 1,
                        reason: format!("invalid {} value `{}`", name, value.trim()),
                    })
            };

            let label = parts[0].trim().to_string();
            let color = Rgb([
                channel(parts[1], "red")?,
                channel(parts[2], "green")?,
                channel(parts[3], "blue")?,
            ]);
            colors.insert(label, color);
        }

        Ok(Self { colors })
    }

    pub fn color_for(&self, label: &str) -> Rgb<u8> {
        self.colors.get(label).copied().unwrap_or(DEFAULT_COLOR)
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}
