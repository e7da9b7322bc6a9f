use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

pub type PostId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_metadata: Option<LinkMetadata>,
}

impl Post {
    pub(crate) fn new(content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            timestamp: OffsetDateTime::now_utc(),
            link_metadata: None,
        }
    }
}

/// Preview data for the link found in a post.
///
/// Image fields hold JPEG bytes produced at fetch time and are stored as
/// base64 inside the persisted payload.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMetadata {
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_image: Option<Vec<u8>>,
    #[serde_as(as = "Option<Base64>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_icon: Option<Vec<u8>>,
}

impl LinkMetadata {
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}
