//! Tag names the feed parser looks for.

use serde::{Deserialize, Serialize};

/// Element names of one dictionary feed flavour.
///
/// Every name is matched exactly (case-sensitive) against local element names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedLayout {
    /// Document root.
    pub root: String,
    /// Optional header block directly under the root.
    pub header: String,
    /// Header children captured into `FeedHeader`.
    pub header_kind: String,
    pub header_version: String,
    pub header_date: String,
    /// One entry per dictionary row, directly under the root.
    pub entry: String,
    /// Explicit record id. When `None` the entry code doubles as the id.
    pub id: Option<String>,
    pub code: String,
    pub name: String,
    pub begin_date: String,
    pub end_date: String,
}

impl FeedLayout {
    /// Layout of the federal medical care form (`FRMMP`) reference feed.
    pub fn medical_care_form() -> Self {
        Self {
            root: "packet".to_string(),
            header: "zglv".to_string(),
            header_kind: "type".to_string(),
            header_version: "version".to_string(),
            header_date: "date".to_string(),
            entry: "zap".to_string(),
            id: None,
            code: "IDFRMMP".to_string(),
            name: "FRMMPNAME".to_string(),
            begin_date: "DATEBEG".to_string(),
            end_date: "DATEEND".to_string(),
        }
    }

    pub(crate) fn field_for(&self, tag: &str) -> Option<EntryField> {
        if self.id.as_deref() == Some(tag) {
            Some(EntryField::Id)
        } else if tag == self.code {
            Some(EntryField::Code)
        } else if tag == self.name {
            Some(EntryField::Name)
        } else if tag == self.begin_date {
            Some(EntryField::BeginDate)
        } else if tag == self.end_date {
            Some(EntryField::EndDate)
        } else {
            None
        }
    }

    pub(crate) fn header_field_for(&self, tag: &str) -> Option<HeaderField> {
        if tag == self.header_kind {
            Some(HeaderField::Kind)
        } else if tag == self.header_version {
            Some(HeaderField::Version)
        } else if tag == self.header_date {
            Some(HeaderField::Date)
        } else {
            None
        }
    }
}

impl Default for FeedLayout {
    fn default() -> Self {
        Self::medical_care_form()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryField {
    Id,
    Code,
    Name,
    BeginDate,
    EndDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderField {
    Kind,
    Version,
    Date,
}
