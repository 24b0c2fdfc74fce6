// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Input-spec configuration and its textual grammar.
//!
//! Each rewriter input carries one spec describing what happens to
//! packets with no existing mapping:
//!
//! ```text
//! drop | discard
//! pass <OUTPUT> | nochange <OUTPUT>
//! keep <FOUT> <ROUT>
//! pattern <SADDR> <SPORT> <DADDR> <DPORT> <FOUT> <ROUT>
//! pattern <NAME> <FOUT> <ROUT>
//! <MAPPER-NAME>
//! ```

use crate::mapper::IpMapper;
use crate::pattern::{Pattern, PatternError, PatternSet};
use std::collections::HashMap;
use std::sync::Arc;

/// A configuration error reported when a rewriter is built; it prevents
/// startup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpecError {
    /// The spec string is empty.
    #[error("empty input spec")]
    Empty,
    /// The spec does not match the grammar.
    #[error("syntax error, expected {expected}")]
    Syntax {
        /// What the parser was looking for.
        expected: &'static str,
    },
    /// The first word is neither a keyword nor a registered mapper.
    #[error("unknown input specification {0:?}")]
    Unknown(String),
    /// A pattern field is malformed or unresolved.
    #[error(transparent)]
    Pattern(#[from] PatternError),
    /// An output port is not backed by the element.
    #[error("output port {output} out of range (element has {available})")]
    OutputOutOfRange {
        /// The offending port.
        output: u16,
        /// How many outputs exist.
        available: u16,
    },
    /// A mapper was registered twice under one name.
    #[error("duplicate mapper name {0:?}")]
    DuplicateMapper(String),
    /// The reply-annotation offset does not fit the annotation area.
    #[error("reply annotation offset {0} out of range")]
    ReplyAnnoOutOfRange(u8),
    /// A keyword argument is malformed.
    #[error("bad value {value:?} for keyword {keyword}")]
    BadKeyword {
        /// The keyword name.
        keyword: &'static str,
        /// The offending value.
        value: String,
    },
    /// Paired elements must share one flow table.
    #[error("elements do not share a flow table")]
    TableMismatch,
}

/// One input's configuration, resolved against the pattern and mapper
/// registries.
#[derive(Debug, Clone)]
pub enum InputSpecConfig {
    /// Unmapped packets are dropped.
    Drop,
    /// Unmapped packets pass unchanged on `output`; nothing is installed.
    Nochange {
        /// Output port for passed packets.
        output: u16,
    },
    /// Install an identity mapping.
    Keep {
        /// Forward output port.
        foutput: u16,
        /// Reply output port.
        routput: u16,
    },
    /// Install a mapping allocated from a pattern.
    Pattern {
        /// The rewrite template.
        pattern: Arc<Pattern>,
        /// Forward output port.
        foutput: u16,
        /// Reply output port.
        routput: u16,
    },
    /// Delegate the rewrite decision to a mapper.
    Mapper {
        /// The mapper strategy.
        mapper: Arc<dyn IpMapper>,
    },
}

impl InputSpecConfig {
    /// Parse one spec string against the given registries.
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] describing the first problem found.
    pub fn parse(
        spec: &str,
        patterns: &PatternSet,
        mappers: &MapperSet,
    ) -> Result<InputSpecConfig, SpecError> {
        let words: Vec<&str> = spec.split_whitespace().collect();
        let Some((&word, rest)) = words.split_first() else {
            return Err(SpecError::Empty);
        };

        match word {
            "drop" | "discard" => {
                if rest.is_empty() {
                    Ok(InputSpecConfig::Drop)
                } else {
                    Err(SpecError::Syntax { expected: "drop" })
                }
            }
            "pass" | "passthrough" | "nochange" => {
                let output = match rest {
                    [] => 0,
                    [port] => parse_u16(port, "nochange [OUTPUT]")?,
                    _ => return Err(SpecError::Syntax {
                        expected: "nochange [OUTPUT]",
                    }),
                };
                Ok(InputSpecConfig::Nochange { output })
            }
            "keep" => {
                let [fout, rout] = rest else {
                    return Err(SpecError::Syntax {
                        expected: "keep FOUT ROUT",
                    });
                };
                Ok(InputSpecConfig::Keep {
                    foutput: parse_u16(fout, "keep FOUT ROUT")?,
                    routput: parse_u16(rout, "keep FOUT ROUT")?,
                })
            }
            "pattern" | "xpattern" => {
                let pattern = match rest.len() {
                    3 => patterns
                        .get(rest[0])
                        .ok_or_else(|| PatternError::NoSuchPattern(rest[0].to_string()))?,
                    6 => Arc::new(Pattern::parse(&rest[..4])?),
                    _ => {
                        return Err(SpecError::Syntax {
                            expected: "pattern SADDR SPORT DADDR DPORT FOUT ROUT",
                        });
                    }
                };
                let ports = &rest[rest.len() - 2..];
                Ok(InputSpecConfig::Pattern {
                    pattern,
                    foutput: parse_u16(ports[0], "pattern ... FOUT ROUT")?,
                    routput: parse_u16(ports[1], "pattern ... FOUT ROUT")?,
                })
            }
            name => {
                if !rest.is_empty() {
                    return Err(SpecError::Syntax {
                        expected: "mapper element name",
                    });
                }
                mappers
                    .get(name)
                    .map(|mapper| InputSpecConfig::Mapper { mapper })
                    .ok_or_else(|| SpecError::Unknown(name.to_string()))
            }
        }
    }
}

fn parse_u16(word: &str, expected: &'static str) -> Result<u16, SpecError> {
    word.parse::<u16>()
        .map_err(|_| SpecError::Syntax { expected })
}

/// A registry of named mapper elements, matched by the bare-name spec
/// form.
#[derive(Debug, Default)]
pub struct MapperSet {
    mappers: HashMap<String, Arc<dyn IpMapper>>,
}

impl MapperSet {
    /// An empty registry.
    #[must_use]
    pub fn new() -> MapperSet {
        MapperSet::default()
    }

    /// Register a mapper under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::DuplicateMapper`] when the name is taken.
    pub fn insert(&mut self, name: &str, mapper: Arc<dyn IpMapper>) -> Result<(), SpecError> {
        if self.mappers.contains_key(name) {
            return Err(SpecError::DuplicateMapper(name.to_string()));
        }
        self.mappers.insert(name.to_string(), mapper);
        Ok(())
    }

    /// Look up a mapper by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn IpMapper>> {
        self.mappers.get(name).cloned()
    }
}
