//! アカウントごとの同期処理
//!
//! ログイン → 生成状態の確認 → (必要なら生成要求) → 最新レポートの特定
//! → ダウンロード → 出力CSVへの変換 を1アカウントずつ順番に実行する。
//! 1アカウントの失敗は記録して次のアカウントへ進む。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use reqwest::Url;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{AccountConfig, AuthPolicy, RunConfig};
use crate::error::{Result, SyncError};
use crate::mapping::InjectedFields;
use crate::output::{self, OutputSummary};
use crate::report::{self, ArtifactRule, ReportState};
use crate::session::{DriverFactory, SessionDriver, StrategyFactory};

/// 1アカウント分の結果
#[derive(Debug, Clone)]
pub struct AccountReport {
    pub state: ReportState,
    pub triggered: bool,
    pub artifact_url: String,
    pub outputs: Vec<OutputSummary>,
}

#[derive(Debug)]
pub struct AccountOutcome {
    pub account: String,
    pub result: Result<AccountReport>,
}

/// 実行全体の結果
#[derive(Debug)]
pub struct RunReport {
    pub ingested_on: NaiveDate,
    pub accounts: Vec<AccountOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &AccountOutcome> {
        self.accounts.iter().filter(|outcome| outcome.result.is_err())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

pub struct SyncPipeline {
    config: RunConfig,
    factory: Arc<dyn DriverFactory>,
}

impl SyncPipeline {
    /// 設定の strategy に従ってドライバを作る
    pub fn new(config: RunConfig) -> Self {
        let factory = Arc::new(StrategyFactory::from_config(&config));
        Self { config, factory }
    }

    pub fn with_factory(config: RunConfig, factory: Arc<dyn DriverFactory>) -> Self {
        Self { config, factory }
    }

    /// 全アカウントを順番に処理する。取込日付は実行ごとに1回だけ決める
    pub async fn run(&self) -> RunReport {
        let ingested_on = Utc::now().date_naive();
        let span = info_span!("sync_run", ingested_on = %ingested_on);

        async move {
            info!(
                accounts = self.config.accounts.len(),
                strategy = ?self.config.strategy,
                "Starting report sync"
            );

            let mut report = RunReport {
                ingested_on,
                accounts: Vec::with_capacity(self.config.accounts.len()),
            };

            // 設定が不正なら何も書き込まない
            if let Err(e) = self.config.validate() {
                error!(error = %e, "Invalid configuration, no account synced");
                let reason = match e {
                    SyncError::Config(reason) => reason,
                    other => other.to_string(),
                };
                report.accounts = self
                    .config
                    .accounts
                    .iter()
                    .map(|account| AccountOutcome {
                        account: account.name.clone(),
                        result: Err(SyncError::Config(reason.clone())),
                    })
                    .collect();
                return report;
            }

            for account in &self.config.accounts {
                let result = self.sync_account(account, ingested_on).await;
                if let Err(e) = &result {
                    error!(account = %account.name, error = %e, "Account sync failed");
                }
                report.accounts.push(AccountOutcome {
                    account: account.name.clone(),
                    result,
                });
            }

            info!(
                accounts = report.accounts.len(),
                failed = report.failures().count(),
                "Done"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// 1アカウント分。ドライバの close と一時ディレクトリの掃除は結果に関わらず行う
    pub async fn sync_account(
        &self,
        account: &AccountConfig,
        ingested_on: NaiveDate,
    ) -> Result<AccountReport> {
        let span = info_span!("account", name = %account.name, country = %account.country);

        async move {
            let scratch_dir = self.config.scratch_dir();
            let output_dir = self.config.output_dir();
            std::fs::create_dir_all(&scratch_dir)?;
            std::fs::create_dir_all(&output_dir)?;

            let injected = InjectedFields::new(
                account.country.as_str(),
                account.distrchan.as_str(),
                self.config.source_tag.as_str(),
                ingested_on,
            );

            let mut driver = self.factory.open(account).await?;
            let result = self
                .drive(driver.as_mut(), account, &injected, &output_dir)
                .await;

            if let Err(e) = driver.close().await {
                warn!(error = %e, "Failed to close session");
            }
            clear_dir(&scratch_dir);

            result
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        driver: &mut dyn SessionDriver,
        account: &AccountConfig,
        injected: &InjectedFields,
        output_dir: &Path,
    ) -> Result<AccountReport> {
        if let Err(e) = driver.authenticate(account).await {
            match self.config.auth_failure {
                AuthPolicy::FailFast => return Err(e),
                AuthPolicy::BestEffort => {
                    error!(error = %e, "Failed to log in, continuing");
                }
            }
        }

        let report_url = account.report_url();
        let page = driver.navigate(&report_url).await?;

        info!("Checking if report is generating");
        let fragment = report::find_status_fragment(&page, account.status_cell_index);
        let state = fragment
            .as_deref()
            .map(report::detect_state)
            .unwrap_or(ReportState::Unknown);

        let mut triggered = false;
        match (&state, fragment.as_deref()) {
            (ReportState::InProgress { started_at }, _) => {
                info!(
                    started_at = %started_at.format("%Y-%m-%d %H:%M:%S"),
                    "Current report is still generating, not requesting a new one"
                );
            }
            (ReportState::Ready, Some(fragment)) => {
                info!("Getting url for new report");
                let params = report::extract_params(fragment);
                info!(
                    count = params.len(),
                    params = ?params.keys().collect::<Vec<_>>(),
                    "Extracted report parameters"
                );
                match driver.trigger_generation(account, &params).await {
                    Ok(()) => triggered = true,
                    Err(e) => error!(error = %e, "Failed to generate new report"),
                }
            }
            _ => warn!(
                cell = account.status_cell_index,
                "Status cell not found on report page"
            ),
        }

        let listing = driver.navigate(&report_url).await?;
        info!("Getting last available report url");
        let artifact_url = locate(&listing, &report_url, &self.config.artifact)?;
        debug!(url = %artifact_url, "Report artifact located");

        let source = driver.download(&artifact_url).await?;
        let outputs = output::normalize(&source, &account.outputs, injected, output_dir)?;

        Ok(AccountReport {
            state,
            triggered,
            artifact_url,
            outputs,
        })
    }
}

/// href を絶対URLにして返す
fn locate(listing: &str, page_url: &str, rule: &ArtifactRule) -> Result<String> {
    let artifact = report::locate_artifact(listing, rule)
        .ok_or_else(|| SyncError::ArtifactNotFound(page_url.to_string()))?;

    match Url::parse(page_url).and_then(|base| base.join(&artifact.url)) {
        Ok(url) => Ok(url.into()),
        Err(e) => {
            debug!(error = %e, href = %artifact.url, "Cannot resolve href, using as is");
            Ok(artifact.url)
        }
    }
}

/// 前のアカウントのファイルを残さない
fn clear_dir(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(error = %e, dir = ?dir, "Cannot read scratch dir");
            return;
        }
    };

    for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
        let removed = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!(error = %e, path = ?path, "Failed to remove scratch file");
        }
    }
}

/// 出力ファイルの一覧 (ログ・CLI表示用)
pub fn output_paths(report: &RunReport) -> Vec<PathBuf> {
    report
        .accounts
        .iter()
        .filter_map(|outcome| outcome.result.as_ref().ok())
        .flat_map(|r| r.outputs.iter().map(|o| o.path.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_resolves_relative_href() {
        let listing = r#"<a href="/files/sortiment-report-20240517.csv">csv</a>"#;

        let url = locate(
            listing,
            "https://portal.example/obchody/sortiment-report/",
            &ArtifactRule::default(),
        )
        .unwrap();

        assert_eq!(url, "https://portal.example/files/sortiment-report-20240517.csv");
    }

    #[test]
    fn test_locate_keeps_absolute_href() {
        let listing = r#"<a href="https://cdn.example/sortiment-report.csv">csv</a>"#;

        let url = locate(listing, "https://portal.example/", &ArtifactRule::default()).unwrap();

        assert_eq!(url, "https://cdn.example/sortiment-report.csv");
    }

    #[test]
    fn test_locate_not_found() {
        let result = locate("<p>nothing</p>", "https://portal.example/", &ArtifactRule::default());
        assert!(matches!(result, Err(SyncError::ArtifactNotFound(_))));
    }

    #[test]
    fn test_clear_dir_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.csv"), "x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        clear_dir(dir.path());

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(dir.path().exists());
    }
}
