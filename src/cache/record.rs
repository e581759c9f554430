// src/cache/record.rs

//! Typed cache records and their `|`-tagged text descriptor.
//!
//! A descriptor is a sequence of fields, each `|` + one tag character + a
//! value:
//!
//! | tag | value                                   |
//! |-----|-----------------------------------------|
//! | `=` | explicit artifact path                  |
//! | `t` | role                                    |
//! | `n` | conflict policy                         |
//! | `u` | privilege requirement                   |
//! | `b` | platform (always written)               |
//! | `f` | launch flag bits                        |
//! | `p` | project members hash                    |
//! | `c` `l` `x` `y` `k` `m` `s` | dependency unit id (repeatable) |
//! | `*` | external reference path (repeatable)    |
//!
//! Paths are percent-escaped so they never contain `|` or a line break.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{LaunchFlags, RunOptions, SourceUnitId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("descriptor must start with '|'")]
    MissingSeparator,

    #[error("empty field in descriptor")]
    EmptyField,

    #[error("unknown descriptor tag '{0}'")]
    UnknownTag(char),

    #[error("malformed value for tag '{tag}': {value:?}")]
    BadValue { tag: char, value: String },

    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
}

/// Something a compiled artifact depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencyRef {
    /// Source file compiled together with the unit.
    CompiledWith(SourceUnitId),
    /// Library unit; checked recursively.
    Library(SourceUnitId),
    Resource(SourceUnitId),
    File(SourceUnitId),
    Icon(SourceUnitId),
    Manifest(SourceUnitId),
    SigningKey(SourceUnitId),
    /// File outside the workspace model, absolute or relative to the root.
    External(PathBuf),
}

impl DependencyRef {
    fn tag(&self) -> char {
        match self {
            DependencyRef::CompiledWith(_) => 'c',
            DependencyRef::Library(_) => 'l',
            DependencyRef::Resource(_) => 'x',
            DependencyRef::File(_) => 'y',
            DependencyRef::Icon(_) => 'k',
            DependencyRef::Manifest(_) => 'm',
            DependencyRef::SigningKey(_) => 's',
            DependencyRef::External(_) => '*',
        }
    }

    /// The referenced unit, for every variant except `External`.
    pub fn unit(&self) -> Option<SourceUnitId> {
        match self {
            DependencyRef::CompiledWith(id)
            | DependencyRef::Library(id)
            | DependencyRef::Resource(id)
            | DependencyRef::File(id)
            | DependencyRef::Icon(id)
            | DependencyRef::Manifest(id)
            | DependencyRef::SigningKey(id) => Some(*id),
            DependencyRef::External(_) => None,
        }
    }

    fn from_unit_tag(tag: char, id: SourceUnitId) -> Option<Self> {
        let dep = match tag {
            'c' => DependencyRef::CompiledWith(id),
            'l' => DependencyRef::Library(id),
            'x' => DependencyRef::Resource(id),
            'y' => DependencyRef::File(id),
            'k' => DependencyRef::Icon(id),
            'm' => DependencyRef::Manifest(id),
            's' => DependencyRef::SigningKey(id),
            _ => return None,
        };
        Some(dep)
    }
}

/// Everything remembered about the last successful build of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheRecord {
    /// Explicit artifact path; `None` means the convention path in the
    /// cache directory.
    pub output: Option<PathBuf>,
    pub options: RunOptions,
    /// Hash over the project's member ids, for multi-file projects.
    pub project_hash: Option<String>,
    pub dependencies: Vec<DependencyRef>,
}

impl CacheRecord {
    /// Encode as a descriptor string (without the leading unit id).
    pub fn encode(&self) -> Result<String, RecordError> {
        let defaults = RunOptions::default();
        let mut out = String::new();

        if let Some(output) = &self.output {
            push_field(&mut out, '=', &escape_path(output)?);
        }
        if self.options.role != defaults.role {
            push_field(&mut out, 't', self.options.role.as_str());
        }
        if self.options.conflict_policy != defaults.conflict_policy {
            push_field(&mut out, 'n', self.options.conflict_policy.as_str());
        }
        if self.options.privilege != defaults.privilege {
            push_field(&mut out, 'u', self.options.privilege.as_str());
        }
        push_field(&mut out, 'b', self.options.platform.as_str());
        if !self.options.flags.is_empty() {
            push_field(&mut out, 'f', &self.options.flags.bits().to_string());
        }
        if let Some(hash) = &self.project_hash {
            push_field(&mut out, 'p', hash);
        }
        for dep in &self.dependencies {
            match dep {
                DependencyRef::External(path) => push_field(&mut out, '*', &escape_path(path)?),
                other => {
                    if let Some(id) = other.unit() {
                        push_field(&mut out, other.tag(), &id.to_string());
                    }
                }
            }
        }

        Ok(out)
    }

    /// Decode a descriptor string. Any unknown tag or malformed value fails
    /// the whole record.
    pub fn decode(descriptor: &str) -> Result<Self, RecordError> {
        let mut fields = descriptor.split('|');
        match fields.next() {
            Some("") => {}
            _ => return Err(RecordError::MissingSeparator),
        }

        let mut record = CacheRecord::default();
        for field in fields {
            let mut chars = field.chars();
            let tag = chars.next().ok_or(RecordError::EmptyField)?;
            let value = chars.as_str();
            let bad = || RecordError::BadValue {
                tag,
                value: value.to_string(),
            };

            match tag {
                '=' => record.output = Some(unescape_path(tag, value)?),
                't' => record.options.role = value.parse().map_err(|_| bad())?,
                'n' => record.options.conflict_policy = value.parse().map_err(|_| bad())?,
                'u' => record.options.privilege = value.parse().map_err(|_| bad())?,
                'b' => record.options.platform = value.parse().map_err(|_| bad())?,
                'f' => {
                    let bits: u32 = value.parse().map_err(|_| bad())?;
                    record.options.flags = LaunchFlags::from_bits(bits).ok_or_else(bad)?;
                }
                'p' => {
                    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(bad());
                    }
                    record.project_hash = Some(value.to_string());
                }
                '*' => record
                    .dependencies
                    .push(DependencyRef::External(unescape_path(tag, value)?)),
                'c' | 'l' | 'x' | 'y' | 'k' | 'm' | 's' => {
                    let id: SourceUnitId = value.parse().map_err(|_| bad())?;
                    if let Some(dep) = DependencyRef::from_unit_tag(tag, id) {
                        record.dependencies.push(dep);
                    }
                }
                other => return Err(RecordError::UnknownTag(other)),
            }
        }

        Ok(record)
    }

    pub fn dependency_units(&self) -> impl Iterator<Item = SourceUnitId> + '_ {
        self.dependencies.iter().filter_map(DependencyRef::unit)
    }
}

/// Split a store line into its leading unit id and decoded descriptor.
///
/// Returns `None` when the line does not start with a valid id.
pub fn parse_line(line: &str) -> Option<(SourceUnitId, Result<CacheRecord, RecordError>)> {
    let digits = line.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let id = line[..digits].parse::<u32>().ok()?;
    Some((SourceUnitId(id), CacheRecord::decode(&line[digits..])))
}

fn push_field(out: &mut String, tag: char, value: &str) {
    out.push('|');
    out.push(tag);
    out.push_str(value);
}

fn escape_path(path: &Path) -> Result<String, RecordError> {
    let s = path
        .to_str()
        .ok_or_else(|| RecordError::NonUtf8Path(path.to_path_buf()))?;
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    Ok(out)
}

fn unescape_path(tag: char, value: &str) -> Result<PathBuf, RecordError> {
    let bad = || RecordError::BadValue {
        tag,
        value: value.to_string(),
    };
    if value.is_empty() {
        return Err(bad());
    }

    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3).ok_or_else(bad)?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| bad())?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map(PathBuf::from).map_err(|_| bad())
}
