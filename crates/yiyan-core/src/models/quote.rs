//! Quote record as served by hitokoto and kept in the local store.

use serde::{Deserialize, Serialize};

/// One quote. Field names follow the remote JSON; missing fields default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quote {
    /// Local id assigned by the quote store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    pub id: u64,
    pub hitokoto: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub from_who: Option<String>,
    pub creator: String,
    pub creator_uid: u64,
    pub reviewer: u64,
    pub uuid: String,
    pub commit_from: String,
    pub created_at: String,
    pub length: u64,
    /// RFC 3339 UTC time this copy was fetched, e.g. `2026-10-19T08:00:00.000Z`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
}

impl Quote {
    /// A quote with just text; handy for tests and manual entries.
    pub fn text(text: impl Into<String>) -> Self {
        let hitokoto: String = text.into();
        Self {
            length: hitokoto.chars().count() as u64,
            hitokoto,
            ..Default::default()
        }
    }

    /// `text —— from_who「from」` style attribution line.
    pub fn attribution(&self) -> String {
        match (self.from_who.as_deref().filter(|w| !w.is_empty()), self.from.is_empty()) {
            (Some(who), false) => format!("—— {}「{}」", who, self.from),
            (Some(who), true) => format!("—— {}", who),
            (None, false) => format!("——「{}」", self.from),
            (None, true) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remote_payload() {
        let json = serde_json::json!({
            "id": 6412,
            "uuid": "b2a8b2f1-58e4-4b2c-8a7f-2f0d2c5b6a11",
            "hitokoto": "我们都是阴沟里的虫子，但总还是得有人仰望星空。",
            "type": "b",
            "from": "三体",
            "from_who": null,
            "creator": "a",
            "creator_uid": 1,
            "reviewer": 0,
            "commit_from": "web",
            "created_at": "1601305765",
            "length": 23
        });
        let q: Quote = serde_json::from_value(json).unwrap();
        assert_eq!(q.id, 6412);
        assert_eq!(q.kind, "b");
        assert_eq!(q.from_who, None);
        assert_eq!(q.cid, None);
        assert_eq!(q.attribution(), "——「三体」");
    }

    #[test]
    fn missing_fields_default() {
        let q: Quote = serde_json::from_str(r#"{"hitokoto": "hi"}"#).unwrap();
        assert_eq!(q.hitokoto, "hi");
        assert_eq!(q.id, 0);
        assert!(q.from.is_empty());
    }

    #[test]
    fn text_sets_length_in_chars() {
        let q = Quote::text("一言一语");
        assert_eq!(q.length, 4);
        assert_eq!(q.attribution(), "");
    }
}
