//! Option schema advertised by an engine during the handshake, and coercion
//! of configured values against it.

use std::collections::BTreeMap;

/// Options the bot sets itself. Configured values for these are ignored.
pub const MANAGED_OPTIONS: &[&str] = &["MultiPV", "Ponder", "UCI_AnalyseMode", "UCI_Chess960"];

/// Options most engines understand, listed by `check-engine` when present.
pub const COMMON_OPTIONS: &[&str] = &[
    "UCI_LimitStrength",
    "UCI_Elo",
    "Skill Level",
    "Threads",
    "Hash",
    "MultiPV",
    "SyzygyPath",
    "SyzygyProbeLimit",
    "Contempt",
    "Ponder",
    "UCI_AnalyseMode",
    "UCI_Chess960",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKind {
    Spin {
        default: Option<i64>,
        min: Option<i64>,
        max: Option<i64>,
    },
    Check {
        default: Option<bool>,
    },
    Combo {
        default: Option<String>,
        choices: Vec<String>,
    },
    Text {
        default: Option<String>,
    },
    Button,
}

impl OptionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Spin { .. } => "spin",
            Self::Check { .. } => "check",
            Self::Combo { .. } => "combo",
            Self::Text { .. } => "string",
            Self::Button => "button",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSpec {
    pub name: String,
    pub kind: OptionKind,
}

/// A configured value after it has been checked against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
    Trigger,
}

impl OptionValue {
    /// The `setoption` line applying this value to option `name`.
    pub fn to_setoption(&self, name: &str) -> String {
        match self {
            Self::Integer(v) => format!("setoption name {name} value {v}"),
            Self::Boolean(v) => format!("setoption name {name} value {v}"),
            Self::Text(v) => format!("setoption name {name} value {v}"),
            Self::Trigger => format!("setoption name {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    #[error("engine does not advertise option '{0}'")]
    Unknown(String),
    #[error("option '{0}' is managed by the bot")]
    Managed(String),
    #[error("option '{name}' expects an integer, got '{value}'")]
    NotAnInteger { name: String, value: String },
    #[error("option '{name}' value {value} is outside {min}..={max}")]
    OutOfRange {
        name: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("option '{name}' expects true or false, got '{value}'")]
    NotABoolean { name: String, value: String },
    #[error("option '{name}' does not accept '{value}'")]
    NotAChoice { name: String, value: String },
}

pub fn is_managed(name: &str) -> bool {
    MANAGED_OPTIONS.iter().any(|m| m.eq_ignore_ascii_case(name))
}

/// Options keyed by lowercase name; UCI option names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct OptionSchema {
    specs: BTreeMap<String, OptionSpec>,
}

impl OptionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: OptionSpec) {
        self.specs.insert(spec.name.to_ascii_lowercase(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.get(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionSpec> {
        self.specs.values()
    }

    /// Check `raw` against the advertised option. Returns the engine's own
    /// spelling of the name with the coerced value.
    pub fn coerce(&self, name: &str, raw: &str) -> Result<(String, OptionValue), OptionError> {
        if is_managed(name) {
            return Err(OptionError::Managed(name.to_string()));
        }
        let spec = self
            .get(name)
            .ok_or_else(|| OptionError::Unknown(name.to_string()))?;
        let raw = raw.trim();

        let value = match &spec.kind {
            OptionKind::Spin { min, max, .. } => {
                let value: i64 = raw.parse().map_err(|_| OptionError::NotAnInteger {
                    name: spec.name.clone(),
                    value: raw.to_string(),
                })?;
                let lo = min.unwrap_or(i64::MIN);
                let hi = max.unwrap_or(i64::MAX);
                if value < lo || value > hi {
                    return Err(OptionError::OutOfRange {
                        name: spec.name.clone(),
                        value,
                        min: lo,
                        max: hi,
                    });
                }
                OptionValue::Integer(value)
            }
            OptionKind::Check { .. } => match raw.to_ascii_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => OptionValue::Boolean(true),
                "false" | "off" | "no" | "0" => OptionValue::Boolean(false),
                _ => {
                    return Err(OptionError::NotABoolean {
                        name: spec.name.clone(),
                        value: raw.to_string(),
                    })
                }
            },
            OptionKind::Combo { choices, .. } => {
                let choice = choices
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(raw))
                    .ok_or_else(|| OptionError::NotAChoice {
                        name: spec.name.clone(),
                        value: raw.to_string(),
                    })?;
                OptionValue::Text(choice.clone())
            }
            OptionKind::Text { .. } => OptionValue::Text(raw.to_string()),
            OptionKind::Button => OptionValue::Trigger,
        };

        Ok((spec.name.clone(), value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OptionSchema {
        let mut schema = OptionSchema::new();
        schema.insert(OptionSpec {
            name: "Hash".into(),
            kind: OptionKind::Spin {
                default: Some(16),
                min: Some(1),
                max: Some(1024),
            },
        });
        schema.insert(OptionSpec {
            name: "Ponder".into(),
            kind: OptionKind::Check {
                default: Some(false),
            },
        });
        schema.insert(OptionSpec {
            name: "UCI_ShowWDL".into(),
            kind: OptionKind::Check { default: None },
        });
        schema.insert(OptionSpec {
            name: "Style".into(),
            kind: OptionKind::Combo {
                default: Some("Normal".into()),
                choices: vec!["Solid".into(), "Normal".into(), "Risky".into()],
            },
        });
        schema.insert(OptionSpec {
            name: "Clear Hash".into(),
            kind: OptionKind::Button,
        });
        schema
    }

    #[test]
    fn test_coerce_spin() {
        let schema = schema();
        assert_eq!(
            schema.coerce("hash", "64").unwrap(),
            ("Hash".to_string(), OptionValue::Integer(64))
        );
        assert!(matches!(
            schema.coerce("Hash", "4096"),
            Err(OptionError::OutOfRange { value: 4096, .. })
        ));
        assert!(matches!(
            schema.coerce("Hash", "lots"),
            Err(OptionError::NotAnInteger { .. })
        ));
    }

    #[test]
    fn test_coerce_check_combo_button() {
        let schema = schema();
        assert_eq!(
            schema.coerce("UCI_ShowWDL", "on").unwrap().1,
            OptionValue::Boolean(true)
        );
        assert_eq!(
            schema.coerce("Style", "risky").unwrap().1,
            OptionValue::Text("Risky".into())
        );
        assert!(matches!(
            schema.coerce("Style", "wild"),
            Err(OptionError::NotAChoice { .. })
        ));
        assert_eq!(schema.coerce("Clear Hash", "").unwrap().1, OptionValue::Trigger);
    }

    #[test]
    fn test_rejects_managed_and_unknown() {
        let schema = schema();
        assert_eq!(
            schema.coerce("ponder", "true"),
            Err(OptionError::Managed("ponder".into()))
        );
        assert_eq!(
            schema.coerce("Threads", "4"),
            Err(OptionError::Unknown("Threads".into()))
        );
    }

    #[test]
    fn test_setoption_lines() {
        assert_eq!(
            OptionValue::Integer(64).to_setoption("Hash"),
            "setoption name Hash value 64"
        );
        assert_eq!(
            OptionValue::Trigger.to_setoption("Clear Hash"),
            "setoption name Clear Hash"
        );
    }
}
