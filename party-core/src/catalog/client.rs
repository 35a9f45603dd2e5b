//! Catalog HTTP Client

use std::collections::HashMap;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::types::*;
use crate::sync::TrackId;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Uploads can be large, so the overall timeout is generous
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when talking to the media catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Catalog is not reachable")]
    NotReachable,

    #[error("Not found in catalog: {0}")]
    NotFound(String),

    #[error("Catalog error: {0}")]
    Api(String),
}

/// Client for the media server's library, upload and stream endpoints
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Where the playback primitive fetches a track's audio
    pub fn stream_url(&self, track_id: &str) -> String {
        format!("{}/stream/{}", self.base_url, track_id)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.http.get(&url).send().await.map_err(map_send_error)?;

        match resp.status() {
            status if status.is_success() => Ok(resp.json().await?),
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound(path.to_string())),
            status => Err(CatalogError::Api(format!("GET {} returned HTTP {}", path, status.as_u16()))),
        }
    }

    /// Fetch the whole track catalog
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn library(&self) -> Result<Vec<CatalogTrack>, CatalogError> {
        let tracks: Vec<CatalogTrack> = self.get_json("/library").await?;
        debug!("Library has {} tracks", tracks.len());
        Ok(tracks)
    }

    /// Metadata for one track.
    ///
    /// Servers without a per-track endpoint answer 404, in which case the
    /// library listing is scanned instead.
    pub async fn track(&self, track_id: &str) -> Result<CatalogTrack, CatalogError> {
        match self.get_json(&format!("/tracks/{}", track_id)).await {
            Err(CatalogError::NotFound(_)) => {
                debug!("No track endpoint for {}, scanning library", track_id);
                self.library()
                    .await?
                    .into_iter()
                    .find(|track| track.id == track_id)
                    .ok_or_else(|| CatalogError::NotFound(track_id.to_string()))
            }
            other => other,
        }
    }

    /// Resolve titles for a set of track ids with a single library fetch
    pub async fn titles(&self, track_ids: &[TrackId]) -> Result<HashMap<TrackId, String>, CatalogError> {
        if track_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let titles = self
            .library()
            .await?
            .into_iter()
            .filter(|track| track_ids.contains(&track.id))
            .map(|track| (track.id, track.title))
            .collect::<HashMap<_, _>>();

        if titles.len() < track_ids.len() {
            warn!("{} track(s) missing from catalog", track_ids.len() - titles.len());
        }
        Ok(titles)
    }

    pub async fn playlist(&self, playlist_id: &str) -> Result<CatalogPlaylist, CatalogError> {
        self.get_json(&format!("/playlists/{}", playlist_id)).await
    }

    /// Upload an audio file; the server assigns the id and derives the title
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn upload(&self, filename: &str, bytes: Vec<u8>) -> Result<CatalogTrack, CatalogError> {
        let form = Form::new().part("file", Part::bytes(bytes).file_name(filename.to_string()));

        let resp = self
            .http
            .post(format!("{}/upload", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(map_send_error)?;

        if !resp.status().is_success() {
            return Err(CatalogError::Api(format!("Upload failed (HTTP {})", resp.status().as_u16())));
        }

        let track: CatalogTrack = resp.json().await?;
        debug!("Uploaded {} as track {}", filename, track.id);
        Ok(track)
    }
}

fn map_send_error(e: reqwest::Error) -> CatalogError {
    if e.is_connect() || e.is_timeout() {
        warn!("Catalog unreachable: {}", e);
        CatalogError::NotReachable
    } else {
        CatalogError::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP responder: maps request paths to (status, json body)
    async fn fake_catalog(routes: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

                let (status, body) = routes
                    .iter()
                    .find(|(route, _, _)| *route == path)
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, "{}"));
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn test_stream_url() {
        let client = CatalogClient::new("http://media.local:8000/").unwrap();
        assert_eq!(client.base_url(), "http://media.local:8000");
        assert_eq!(client.stream_url("12"), "http://media.local:8000/stream/12");
    }

    #[tokio::test]
    async fn test_track_falls_back_to_library_scan() {
        let base = fake_catalog(vec![(
            "/library",
            200,
            r#"[{"id":1,"title":"Intro"},{"id":2,"title":"Outro"}]"#,
        )])
        .await;
        let client = CatalogClient::new(base).unwrap();

        let track = client.track("2").await.unwrap();
        assert_eq!(track.title, "Outro");
        assert!(matches!(client.track("9").await, Err(CatalogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_titles_and_playlist() {
        let base = fake_catalog(vec![
            ("/library", 200, r#"[{"id":1,"title":"Intro"},{"id":2,"title":"Outro"}]"#),
            ("/playlists/p1", 200, r#"{"id":"p1","title":"Mix","tracks":[2,1]}"#),
        ])
        .await;
        let client = CatalogClient::new(base).unwrap();

        let titles = client.titles(&["1".to_string(), "5".to_string()]).await.unwrap();
        assert_eq!(titles.len(), 1);
        assert_eq!(titles["1"], "Intro");

        let playlist = client.playlist("p1").await.unwrap();
        assert_eq!(playlist.tracks, vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let base = fake_catalog(vec![("/library", 500, "{}")]).await;
        let client = CatalogClient::new(base).unwrap();
        assert!(matches!(client.library().await, Err(CatalogError::Api(_))));
    }
}
