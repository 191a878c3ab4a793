//! Event sender configuration string.
//!
//! ```text
//! config  := sender (WS+ sender)*
//! sender  := type ("," name "=" value)*
//! type    := [a-z]+
//! name    := [a-zA-Z]+
//! value   := [^,\s]+
//! ```
//!
//! For example
//! `stdout confluent,address=http://registry:8081,kafka=broker-1:9092;broker-2:9092,replication=3,blocking=true`
//! configures a stdout sender and a Kafka sender using a Confluent registry.
//!
//! | type        | required             | optional                                  |
//! |-------------|----------------------|-------------------------------------------|
//! | `noop`      |                      |                                           |
//! | `stdout`    |                      |                                           |
//! | `stderr`    |                      |                                           |
//! | `gzip`      | `file`               |                                           |
//! | `consul`    | `kafka`, `address`   | `replication`, `bufferSize`, `blocking`   |
//! | `confluent` | `kafka`, `address`   | `replication`, `bufferSize`, `blocking`   |

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::local::{GzipEventSender, WriterEventSender};
use crate::queued::DEFAULT_BUFFER_SIZE;
use crate::sender::{EventSender, NoopEventSender, SenderError};

/// Errors in the sender configuration string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A sender type was expected
    #[error("expected event sender type at '{0}'")]
    ExpectedType(String),

    /// A `,name=value` argument was expected
    #[error("expected argument at '{0}'")]
    ExpectedArgument(String),

    /// The sender type is not known
    #[error("unknown event sender type: {0}")]
    UnknownType(String),

    /// A required argument is missing
    #[error("{sender} event sender: missing argument '{argument}'")]
    MissingArgument {
        /// Sender type
        sender: String,
        /// Argument name
        argument: String,
    },

    /// An argument has an unusable value
    #[error("invalid value '{value}' for argument '{argument}'")]
    InvalidValue {
        /// Argument name
        argument: String,
        /// Offending value
        value: String,
    },
}

/// Kind of event sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderKind {
    /// Discard events
    Noop,
    /// JSON lines on stdout
    Stdout,
    /// JSON lines on stderr
    Stderr,
    /// JSON lines in a gzip file
    Gzip,
    /// Kafka with a Consul-backed content-hash registry
    Consul,
    /// Kafka with a Confluent schema registry
    Confluent,
}

impl SenderKind {
    /// Name used in the configuration string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Gzip => "gzip",
            Self::Consul => "consul",
            Self::Confluent => "confluent",
        }
    }

    const fn required(self) -> &'static [&'static str] {
        match self {
            Self::Noop | Self::Stdout | Self::Stderr => &[],
            Self::Gzip => &["file"],
            Self::Consul | Self::Confluent => &["kafka", "address"],
        }
    }

    /// Whether this sender publishes to Kafka.
    #[must_use]
    pub const fn is_kafka(&self) -> bool {
        matches!(self, Self::Consul | Self::Confluent)
    }
}

impl FromStr for SenderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Self::Noop),
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "gzip" => Ok(Self::Gzip),
            "consul" => Ok(Self::Consul),
            "confluent" => Ok(Self::Confluent),
            other => Err(ConfigError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for SenderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed sender with its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderSpec {
    /// Sender type
    pub kind: SenderKind,
    /// Raw `name=value` arguments
    pub arguments: BTreeMap<String, String>,
}

impl SenderSpec {
    fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        self.argument(name).map_or(Ok(default), |value| {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                argument: name.to_string(),
                value: value.to_string(),
            })
        })
    }

    /// Output file of a gzip sender.
    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.argument("file")
    }

    /// Registry address.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.argument("address")
    }

    /// Kafka bootstrap servers, split on `;`, `,` and whitespace.
    #[must_use]
    pub fn kafka_brokers(&self) -> Vec<String> {
        self.argument("kafka")
            .unwrap_or_default()
            .split(|c: char| c == ';' || c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Replication factor for created topics (default 1).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value is not an integer.
    pub fn replication(&self) -> Result<i32, ConfigError> {
        self.parsed("replication", 1)
    }

    /// Queue capacity (default 1024).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if the value is not a positive integer.
    pub fn buffer_size(&self) -> Result<usize, ConfigError> {
        match self.parsed("bufferSize", DEFAULT_BUFFER_SIZE)? {
            0 => Err(ConfigError::InvalidValue {
                argument: "bufferSize".to_string(),
                value: "0".to_string(),
            }),
            size => Ok(size),
        }
    }

    /// Whether `send` waits for queue space. Only the literal `true` enables it.
    #[must_use]
    pub fn blocking(&self) -> bool {
        self.argument("blocking") == Some("true")
    }

    /// Build the sender if it does not need a broker.
    ///
    /// Returns `Ok(None)` for Kafka senders.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError`] if a gzip file cannot be created.
    pub fn build_local(&self) -> Result<Option<Arc<dyn EventSender>>, SenderError> {
        let sender: Arc<dyn EventSender> = match self.kind {
            SenderKind::Noop => Arc::new(NoopEventSender),
            SenderKind::Stdout => Arc::new(WriterEventSender::stdout()),
            SenderKind::Stderr => Arc::new(WriterEventSender::stderr()),
            SenderKind::Gzip => {
                let file = self.file().ok_or_else(|| ConfigError::MissingArgument {
                    sender: self.kind.to_string(),
                    argument: "file".to_string(),
                })?;
                Arc::new(GzipEventSender::create(file)?)
            }
            SenderKind::Consul | SenderKind::Confluent => return Ok(None),
        };
        Ok(Some(sender))
    }
}

fn shorten(rest: &str) -> String {
    match rest.char_indices().nth(15) {
        Some((idx, _)) if rest.chars().count() > 16 => format!("{}…", &rest[..idx]),
        _ => rest.to_string(),
    }
}

fn take_while(input: &str, pred: impl Fn(char) -> bool) -> (&str, &str) {
    let end = input.find(|c: char| !pred(c)).unwrap_or(input.len());
    input.split_at(end)
}

/// Parse a configuration string into sender specs.
///
/// An empty (or all-whitespace) string yields no senders.
///
/// # Errors
///
/// Returns [`ConfigError`] on a syntax error, an unknown sender type, or a
/// missing required argument.
pub fn parse_senders(config: &str) -> Result<Vec<SenderSpec>, ConfigError> {
    let mut specs = Vec::new();
    let mut rest = config.trim_start();

    while !rest.is_empty() {
        let (kind, after) = take_while(rest, |c| c.is_ascii_lowercase());
        if kind.is_empty() {
            return Err(ConfigError::ExpectedType(shorten(rest)));
        }
        let kind: SenderKind = kind.parse()?;
        rest = after;

        let mut arguments = BTreeMap::new();
        while let Some(argument) = rest.strip_prefix(',') {
            let (name, after) = take_while(argument, |c| c.is_ascii_alphabetic());
            let Some(after) = after.strip_prefix('=').filter(|_| !name.is_empty()) else {
                return Err(ConfigError::ExpectedArgument(shorten(rest)));
            };
            let (value, after) = take_while(after, |c| c != ',' && !c.is_whitespace());
            if value.is_empty() {
                return Err(ConfigError::ExpectedArgument(shorten(rest)));
            }
            arguments.insert(name.to_string(), value.to_string());
            rest = after;
        }

        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return Err(ConfigError::ExpectedArgument(shorten(rest)));
        }

        for required in kind.required() {
            if arguments.get(*required).is_none_or(String::is_empty) {
                return Err(ConfigError::MissingArgument {
                    sender: kind.to_string(),
                    argument: (*required).to_string(),
                });
            }
        }

        specs.push(SenderSpec { kind, arguments });
        rest = rest.trim_start();
    }

    Ok(specs)
}
