use serde::{Deserialize, Serialize};

/// one playable stream variant as handed to the player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSource {
    pub url: String,
    #[serde(rename = "isM3U8")]
    pub is_m3u8: bool,
    pub quality: String,
}

/// subtitle/caption side-channel, kind is usually "captions" or "thumbnails"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub url: String,
    pub lang: String,
    pub kind: String,
}

/// the resolved payload for one episode, this is both the cache value and the
/// response body of the sources endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSources {
    pub sources: Vec<VideoSource>,
    pub tracks: Vec<SubtitleTrack>,
}
