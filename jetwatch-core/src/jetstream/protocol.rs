//! Wire types for the Jetstream firehose.
//!
//! Deserialization is deliberately permissive: unknown `kind` values and
//! unrecognized collections fall through to `JetstreamEvent::Other` / are
//! ignored by the dispatcher rather than causing a parse failure. Only
//! genuinely malformed JSON should skip a frame.

use serde::{Deserialize, Serialize};

pub const COLLECTION_PROFILE: &str = "app.bsky.actor.profile";
pub const COLLECTION_FOLLOW: &str = "app.bsky.graph.follow";

#[derive(Clone, Debug, Deserialize)]
pub struct JetstreamFrame {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    #[serde(default)]
    pub identity: Option<IdentityEvent>,
    #[serde(default)]
    pub commit: Option<CommitEvent>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdentityEvent {
    pub did: String,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default)]
    pub time: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitOperation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommitEvent {
    pub operation: CommitOperation,
    pub collection: String,
    #[serde(default)]
    pub rkey: Option<String>,
    #[serde(default)]
    pub record: Option<CommitRecord>,
}

/// Union of the two record shapes we care about. Both fields are optional
/// since a profile record and a follow record never populate the same ones;
/// `serde(default)` means an absent field just deserializes to `None`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CommitRecord {
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<AvatarRef>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AvatarRef {
    #[serde(default, rename = "ref")]
    pub link: Option<BlobLink>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BlobLink {
    #[serde(rename = "$link")]
    pub link: String,
}

impl CommitRecord {
    pub fn avatar_cid(&self) -> Option<&str> {
        self.avatar.as_ref()?.link.as_ref().map(|l| l.link.as_str())
    }
}

/// The subscriber-sourced "hello" sent as the first frame after connect.
/// May be re-sent mid-connection to update filters.
#[derive(Clone, Debug, Serialize)]
pub struct OptionsUpdateMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: OptionsPayload,
}

#[derive(Clone, Debug, Serialize)]
pub struct OptionsPayload {
    #[serde(rename = "wantedCollections")]
    pub wanted_collections: Vec<&'static str>,
    #[serde(rename = "wantedDids")]
    pub wanted_dids: Vec<String>,
    #[serde(rename = "maxMessageSizeBytes")]
    pub max_message_size_bytes: u64,
}

impl OptionsUpdateMessage {
    pub fn new(wanted_dids: Vec<String>) -> Self {
        Self {
            kind: "options_update",
            payload: OptionsPayload {
                wanted_collections: vec![COLLECTION_PROFILE, COLLECTION_FOLLOW],
                wanted_dids,
                max_message_size_bytes: 0,
            },
        }
    }

    /// Builds an options message scoped to a single user's follow list, as
    /// the temporary backfill stream sends.
    pub fn for_single_user(follow_dids: Vec<String>) -> Self {
        Self::new(follow_dids)
    }
}

#[derive(Clone, Debug)]
pub enum DecodedEvent {
    Identity(IdentityEvent),
    ProfileCommit {
        did: String,
        operation: CommitOperation,
        record: Option<CommitRecord>,
    },
    FollowCommit {
        did: String,
        operation: CommitOperation,
        rkey: Option<String>,
        record: Option<CommitRecord>,
    },
    Ignored,
}

impl JetstreamFrame {
    pub fn decode(&self) -> DecodedEvent {
        match self.kind.as_str() {
            "identity" => match &self.identity {
                Some(identity) => DecodedEvent::Identity(identity.clone()),
                None => DecodedEvent::Ignored,
            },
            "commit" => match &self.commit {
                Some(commit) if commit.collection == COLLECTION_PROFILE => {
                    DecodedEvent::ProfileCommit {
                        did: self.did.clone(),
                        operation: commit.operation,
                        record: commit.record.clone(),
                    }
                }
                Some(commit) if commit.collection == COLLECTION_FOLLOW => {
                    DecodedEvent::FollowCommit {
                        did: self.did.clone(),
                        operation: commit.operation,
                        rkey: commit.rkey.clone(),
                        record: commit.record.clone(),
                    }
                }
                _ => DecodedEvent::Ignored,
            },
            _ => DecodedEvent::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_identity_frame() {
        let json = r#"{"did":"did:plc:a","time_us":1700000000000000,"kind":"identity","identity":{"did":"did:plc:a","handle":"new.alice.example","seq":1}}"#;
        let frame: JetstreamFrame = serde_json::from_str(json).unwrap();
        match frame.decode() {
            DecodedEvent::Identity(identity) => {
                assert_eq!(identity.handle.as_deref(), Some("new.alice.example"));
            }
            other => panic!("expected identity event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_profile_commit_with_avatar() {
        let json = r#"{"did":"did:plc:b","time_us":1,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.actor.profile","record":{"displayName":"Bob","avatar":{"ref":{"$link":"cid1"}}}}}"#;
        let frame: JetstreamFrame = serde_json::from_str(json).unwrap();
        match frame.decode() {
            DecodedEvent::ProfileCommit { record, .. } => {
                let record = record.unwrap();
                assert_eq!(record.display_name.as_deref(), Some("Bob"));
                assert_eq!(record.avatar_cid(), Some("cid1"));
            }
            other => panic!("expected profile commit, got {other:?}"),
        }
    }

    #[test]
    fn decodes_follow_commit() {
        let json = r#"{"did":"did:plc:u","time_us":1,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.graph.follow","rkey":"k1","record":{"subject":"did:plc:c"}}}"#;
        let frame: JetstreamFrame = serde_json::from_str(json).unwrap();
        match frame.decode() {
            DecodedEvent::FollowCommit { rkey, record, .. } => {
                assert_eq!(rkey.as_deref(), Some("k1"));
                assert_eq!(record.unwrap().subject.as_deref(), Some("did:plc:c"));
            }
            other => panic!("expected follow commit, got {other:?}"),
        }
    }

    #[test]
    fn unknown_collection_ignored() {
        let json = r#"{"did":"did:plc:u","time_us":1,"kind":"commit","commit":{"operation":"create","collection":"app.bsky.feed.post"}}"#;
        let frame: JetstreamFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame.decode(), DecodedEvent::Ignored));
    }

    #[test]
    fn options_message_caps_nothing_itself() {
        // capping to 10_000 happens at the caller (cursor::build_options_message);
        // this just checks the wire shape.
        let msg = OptionsUpdateMessage::new(vec!["did:plc:a".into()]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"options_update\""));
        assert!(json.contains("\"maxMessageSizeBytes\":0"));
    }
}
