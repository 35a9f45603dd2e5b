//! Types for catalog API responses

use serde::{Deserialize, Deserializer, Serialize};

use crate::sync::{track_id_from_any, TrackId};

/// One entry of the media library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTrack {
    #[serde(deserialize_with = "track_id_from_any")]
    pub id: TrackId,
    pub title: String,
}

/// A named, ordered list of tracks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPlaylist {
    #[serde(deserialize_with = "track_id_from_any")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "track_ids_from_any")]
    pub tracks: Vec<TrackId>,
}

#[derive(Deserialize)]
struct AnyTrackId(#[serde(deserialize_with = "track_id_from_any")] TrackId);

fn track_ids_from_any<'de, D>(deserializer: D) -> Result<Vec<TrackId>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Vec::<AnyTrackId>::deserialize(deserializer)?;
    Ok(ids.into_iter().map(|AnyTrackId(id)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_entries_with_numeric_ids() {
        let tracks: Vec<CatalogTrack> =
            serde_json::from_str(r#"[{"id":1,"title":"Intro"},{"id":"b2","title":"Outro"}]"#).unwrap();
        assert_eq!(tracks[0].id, "1");
        assert_eq!(tracks[1].id, "b2");
    }

    #[test]
    fn test_playlist_track_ids() {
        let playlist: CatalogPlaylist =
            serde_json::from_str(r#"{"id":7,"title":"Road trip","tracks":[3,"4",5]}"#).unwrap();
        assert_eq!(playlist.id, "7");
        assert_eq!(playlist.tracks, vec!["3", "4", "5"]);

        let empty: CatalogPlaylist = serde_json::from_str(r#"{"id":"p"}"#).unwrap();
        assert!(empty.tracks.is_empty());
    }
}
