//! The remote HTTP tier.
//!
//! Speaks the artifact API: `PUT /v8/artifacts/{hash}` to upload,
//! `GET` to download, `HEAD` to probe. Authentication beyond carrying the
//! token and team identifiers is someone else's job. Responses classify
//! into three families: disabled (the tier gets dropped), transient
//! (treated as a miss), and miss.

use std::time::Duration;

use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource, RemoteCacheOpts,
};

const DURATION_HEADER: &str = "x-artifact-duration";

pub struct HttpCache {
    client: reqwest::Client,
    api_url: String,
    token: String,
    team_id: Option<String>,
    team_slug: Option<String>,
}

impl HttpCache {
    pub fn new(opts: &RemoteCacheOpts) -> Result<Self, CacheError> {
        let timeout = if opts.timeout_secs == 0 {
            30
        } else {
            opts.timeout_secs
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;
        Ok(HttpCache {
            client,
            api_url: opts.api_url.trim_end_matches('/').to_string(),
            token: opts.token.clone(),
            team_id: opts.team_id.clone(),
            team_slug: opts.team_slug.clone(),
        })
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!("{}/v8/artifacts/{}", self.api_url, hash)
    }

    fn team_params(&self) -> Vec<(&'static str, &str)> {
        let mut params = Vec::new();
        if let Some(team_id) = self.team_id.as_deref() {
            params.push(("teamId", team_id));
        }
        if let Some(team_slug) = self.team_slug.as_deref() {
            params.push(("slug", team_slug));
        }
        params
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let mut body = Vec::new();
        let mut writer = CacheWriter::from_writer(&mut body);
        writer.put_files(anchor, files)?;
        writer.finish()?;

        let response = self
            .client
            .put(self.artifact_url(hash))
            .query(&self.team_params())
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .header(DURATION_HEADER, duration.to_string())
            .body(body)
            .send()
            .await?;

        Self::classify(response).await.map(|_| ())
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let response = self
            .client
            .get(self.artifact_url(hash))
            .query(&self.team_params())
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::classify(response).await?;

        let duration = response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default();

        let body = response.bytes().await?;
        let restored_files = CacheReader::from_reader(body.as_ref()).restore(anchor)?;

        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Remote,
                time_saved: duration,
            },
            restored_files,
        )))
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let response = self
            .client
            .head(self.artifact_url(hash))
            .query(&self.team_params())
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::classify(response).await?;
        let duration = response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default();

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Remote,
            time_saved: duration,
        }))
    }

    /// Sorts a response into ok / disabled / failed. A 402 or 403 means the
    /// cache is disabled for this team and the tier should be dropped.
    async fn classify(response: reqwest::Response) -> Result<reqwest::Response, CacheError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        match status.as_u16() {
            402 | 403 => Err(CacheError::CacheDisabled(message)),
            code => Err(CacheError::Response {
                status: code,
                message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_url_and_params() {
        let cache = HttpCache::new(&RemoteCacheOpts {
            api_url: "https://vercel.com/api/".to_string(),
            token: "token".to_string(),
            team_id: Some("team_123".to_string()),
            team_slug: None,
            timeout_secs: 0,
        })
        .unwrap();

        assert_eq!(
            cache.artifact_url("deadbeef"),
            "https://vercel.com/api/v8/artifacts/deadbeef"
        );
        assert_eq!(cache.team_params(), vec![("teamId", "team_123")]);
    }
}
