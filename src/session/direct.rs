use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::{Client, Request, Response, Url};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{AccountConfig, HttpSettings};
use crate::error::{Result, SyncError};
use crate::report::ReportParams;

use super::SessionDriver;

const FALLBACK_FILE_NAME: &str = "report.csv";

/// Cookieを保持するHTTPセッション
pub struct DirectSession {
    client: Client,
    http: HttpSettings,
    scratch_dir: PathBuf,
}

impl DirectSession {
    pub fn new(http: HttpSettings, scratch_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(http.request_timeout())
            .user_agent(&http.user_agent)
            .build()?;

        Ok(Self {
            client,
            http,
            scratch_dir: scratch_dir.into(),
        })
    }

    fn should_retry(&self, outcome: &Result<Response>) -> bool {
        match outcome {
            Ok(response) => self.http.retry_statuses.contains(&response.status().as_u16()),
            Err(e) => e.is_retryable(&self.http.retry_statuses),
        }
    }

    /// 指定ステータスと通信エラーのみ指数バックオフでリトライする。
    /// リトライを使い切った場合は最後のレスポンスをそのまま返す。
    async fn execute(&self, request: Request) -> Result<Response> {
        let url = request.url().to_string();
        let mut attempt = 0;

        loop {
            let attempt_request = request.try_clone().ok_or_else(|| {
                SyncError::Config(format!("request body cannot be replayed: {}", url))
            })?;
            let outcome = self
                .client
                .execute(attempt_request)
                .await
                .map_err(SyncError::from);

            if attempt >= self.http.max_retries || !self.should_retry(&outcome) {
                return outcome;
            }

            let backoff = self.http.backoff(attempt);
            match &outcome {
                Ok(response) => warn!(
                    url = %url,
                    status = response.status().as_u16(),
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "Portal request failed, retrying"
                ),
                Err(e) => warn!(
                    url = %url,
                    error = %e,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "Portal request failed, retrying"
                ),
            }
            sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn file_name_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()?
                .next_back()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

#[async_trait]
impl SessionDriver for DirectSession {
    async fn authenticate(&mut self, account: &AccountConfig) -> Result<()> {
        info!(login_url = %account.login_url, user = %account.username, "Logging in");

        let form = &account.login_form;
        let mut payload: Vec<(&str, &str)> = form
            .extra_fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        payload.push((form.username_field.as_str(), account.username.as_str()));
        payload.push((form.password_field.as_str(), account.password.expose()));

        let request = self
            .client
            .post(&account.login_url)
            .form(&payload)
            .timeout(self.http.login_timeout())
            .build()?;
        let response = self.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Login(format!(
                "status {} from {}",
                status.as_u16(),
                account.login_url
            )));
        }

        debug!(status = status.as_u16(), "Login form accepted");
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<String> {
        let request = self.client.get(url).build()?;
        let response = self.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            // 本文はそのまま返して処理を続ける
            error!(url = %url, status = status.as_u16(), "Failed to get to report page");
        }

        Ok(response.text().await?)
    }

    async fn trigger_generation(
        &mut self,
        account: &AccountConfig,
        params: &ReportParams,
    ) -> Result<()> {
        let url = params.trigger_url(&account.report_url(), &account.trigger_params)?;
        info!(url = %url, "Requesting new report generation");

        let request = self.client.get(&url).build()?;
        let response = self.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                url,
            });
        }

        Ok(())
    }

    async fn download(&mut self, url: &str) -> Result<PathBuf> {
        info!(url = %url, "Downloading last available report");

        let request = self.client.get(url).build()?;
        let mut response = self.execute(request).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Download(format!(
                "status {} from {}",
                status.as_u16(),
                url
            )));
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(file_name_from_url(url));
        let mut file = tokio::fs::File::create(&path).await?;

        let mut size = 0usize;
        while let Some(chunk) = response.chunk().await? {
            size += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        info!(path = ?path, size, "Report downloaded");
        Ok(path)
    }

    async fn close(&mut self) -> Result<()> {
        // Cookieはクライアントと一緒に破棄される
        debug!("Closing direct session");
        Ok(())
    }
}
