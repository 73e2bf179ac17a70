//
// anonymize.rs
// Dicom-Intake-rs
//
// Tag-level de-identification policy: configurable remove and replace rules applied in order, idempotently.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fmt;

use dicom::core::dictionary::DataDictionary;
use dicom::core::value::PrimitiveValue;
use dicom::core::{DataElement, Tag};
use dicom::dictionary_std::StandardDataDictionary;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};

const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

/// A DICOM tag as written in configuration files, e.g. `"0010,0010"` or `"(0010,0010)"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagKey(pub Tag);

impl TryFrom<String> for TagKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, '(' | ')' | ' '))
            .collect();
        let (group, element) = match cleaned.split_once(',') {
            Some(parts) => parts,
            None if cleaned.len() == 8 && cleaned.is_ascii() => cleaned.split_at(4),
            None => return Err(format!("invalid tag {raw:?}, expected GGGG,EEEE")),
        };
        let parse = |part: &str| {
            u16::from_str_radix(part, 16).map_err(|_| format!("invalid tag {raw:?}"))
        };
        Ok(TagKey(Tag(parse(group)?, parse(element)?)))
    }
}

impl From<TagKey> for String {
    fn from(key: TagKey) -> Self {
        format_tag(key.0)
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_tag(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagAction {
    Remove,
    Replace,
}

/// One entry of the anonymization policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRule {
    pub tag: TagKey,
    pub action: TagAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl TagRule {
    pub fn remove(tag: Tag) -> Self {
        Self {
            tag: TagKey(tag),
            action: TagAction::Remove,
            value: None,
        }
    }

    pub fn replace(tag: Tag, value: &str) -> Self {
        Self {
            tag: TagKey(tag),
            action: TagAction::Replace,
            value: Some(value.to_string()),
        }
    }

    /// Rules may not touch the file meta group or the pixel data.
    pub fn check(&self) -> Result<(), String> {
        let tag = self.tag.0;
        if tag.group() == 0x0002 || tag == PIXEL_DATA {
            return Err(format!("rule for {} targets a protected element", self.tag));
        }
        if self.action == TagAction::Replace && self.value.is_none() {
            return Err(format!("replace rule for {} has no value", self.tag));
        }
        Ok(())
    }
}

/// Default policy: drop patient/institution identifiers, blank out staff names.
pub fn default_rules() -> Vec<TagRule> {
    vec![
        TagRule::remove(Tag(0x0010, 0x0010)), // PatientName
        TagRule::remove(Tag(0x0010, 0x0020)), // PatientID
        TagRule::remove(Tag(0x0010, 0x0030)), // PatientBirthDate
        TagRule::remove(Tag(0x0010, 0x0040)), // PatientSex
        TagRule::remove(Tag(0x0010, 0x1000)), // OtherPatientIDs
        TagRule::remove(Tag(0x0010, 0x1040)), // PatientAddress
        TagRule::remove(Tag(0x0008, 0x0080)), // InstitutionName
        TagRule::remove(Tag(0x0008, 0x0081)), // InstitutionAddress
        TagRule::replace(Tag(0x0008, 0x0090), "ANONYMIZED"), // ReferringPhysicianName
        TagRule::replace(Tag(0x0008, 0x1010), "ANONYMIZED"), // StationName
        TagRule::replace(Tag(0x0008, 0x1070), "ANONYMIZED"), // OperatorsName
    ]
}

#[derive(Debug, thiserror::Error)]
pub enum AnonymizationError {
    #[error("element {tag} could not be read: {reason}")]
    Unreadable { tag: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Anonymizer {
    rules: Vec<TagRule>,
}

impl Anonymizer {
    pub fn new(rules: Vec<TagRule>) -> Self {
        Self { rules }
    }

    /// Apply the policy in rule order and report the tags that actually changed.
    ///
    /// Removing an absent tag or writing a value that is already there is a no-op,
    /// so a second pass over the same object reports nothing.
    pub fn apply(
        &self,
        obj: &mut InMemDicomObject<StandardDataDictionary>,
    ) -> Result<Vec<String>, AnonymizationError> {
        let mut modified = Vec::new();

        for rule in &self.rules {
            let tag = rule.tag.0;
            let Ok(elem) = obj.element(tag) else {
                continue;
            };

            match rule.action {
                TagAction::Remove => {
                    obj.remove_element(tag);
                }
                TagAction::Replace => {
                    let target = rule.value.as_deref().unwrap_or_default();
                    let vr = elem.header().vr;
                    let current = elem.to_str().map_err(|e| AnonymizationError::Unreadable {
                        tag: describe_tag(tag),
                        reason: e.to_string(),
                    })?;
                    if current.trim_end_matches(['\0', ' ']) == target {
                        continue;
                    }
                    obj.put(DataElement::new(tag, vr, PrimitiveValue::from(target)));
                }
            }
            modified.push(describe_tag(tag));
        }

        Ok(modified)
    }
}

pub fn format_tag(tag: Tag) -> String {
    format!("({:04X},{:04X})", tag.group(), tag.element())
}

/// `(GGGG,EEEE) Keyword`, falling back to the bare tag for private elements.
pub fn describe_tag(tag: Tag) -> String {
    match StandardDataDictionary.by_tag(tag) {
        Some(entry) => format!("{} {}", format_tag(tag), entry.alias),
        None => format_tag(tag),
    }
}
