use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MediaKind {
    Logo,
    Banner,
    Gallery,
    ProductImage,
    ProductThumbnail,
}

/// A stored media object counted against its shop's storage quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    pub shop_id: String,
    pub kind: MediaKind,
    pub path: String,
    pub size_bytes: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMedia {
    pub kind: MediaKind,
    pub path: String,
    pub size_bytes: i64,
}
