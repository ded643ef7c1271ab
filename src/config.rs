//! 実行設定
//!
//! JSONファイルから読み込む。秘密情報は `#` で始まるキー (`#password`) に置く。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SyncError};
use crate::mapping::OutputSpec;
use crate::report::ArtifactRule;

/// ログ等に出力されない文字列
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// レポート取得方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// HTTPセッションで直接フォームを送信する
    #[default]
    Direct,
    /// ヘッドレスブラウザで操作する
    Browser,
}

/// ログイン失敗時の方針
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPolicy {
    /// エラーを記録して処理を続ける
    #[default]
    BestEffort,
    /// そのアカウントの処理を中止する
    FailFast,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub max_retries: u32,
    /// バックオフ基準値 (ミリ秒)。n回目のリトライ前に `backoff_factor_ms * 2^n` 待つ
    pub backoff_factor_ms: u64,
    pub retry_statuses: Vec<u16>,
    pub login_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor_ms: 300,
            retry_statuses: vec![500, 501, 502, 503, 504],
            login_timeout_secs: 5,
            request_timeout_secs: 60,
            user_agent: concat!("sortiment-sync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpSettings {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_factor_ms.saturating_mul(2u64.saturating_pow(attempt)))
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    /// 未指定なら環境変数 CHROME_PATH / CHROMIUM_PATH、さらに "chromium"
    pub chrome_path: Option<PathBuf>,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// ダウンロードボタンを押す前の待機 (ミリ秒)
    pub settle_delay_ms: u64,
    pub download_timeout_secs: u64,
    /// ログイン時のスクリーンショットをログに出す
    pub debug: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            viewport_width: 1920,
            viewport_height: 1080,
            settle_delay_ms: 3000,
            download_timeout_secs: 30,
            debug: false,
        }
    }
}

impl BrowserSettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn chrome_executable(&self) -> PathBuf {
        self.chrome_path.clone().unwrap_or_else(|| {
            std::env::var("CHROME_PATH")
                .or_else(|_| std::env::var("CHROMIUM_PATH"))
                .unwrap_or_else(|_| "chromium".to_string())
                .into()
        })
    }
}

/// ログインフォームの項目名 (直接送信用)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username_field: String,
    pub password_field: String,
    /// 一緒に送る固定値
    pub extra_fields: BTreeMap<String, String>,
}

impl Default for LoginForm {
    fn default() -> Self {
        Self {
            username_field: "email".to_string(),
            password_field: "password".to_string(),
            extra_fields: BTreeMap::from([(
                "_do".to_string(),
                "loginForm-loginForm-submit".to_string(),
            )]),
        }
    }
}

/// ブラウザ操作用のセレクタ
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSelectors {
    pub username: String,
    pub password: String,
    pub submit: String,
    /// レポート生成ボタン (無い場合は生成済み)
    pub generate: String,
    /// 未指定なら href がレポートURLと一致するリンクを押す
    pub download: Option<String>,
}

impl Default for BrowserSelectors {
    fn default() -> Self {
        Self {
            username: "#frm-loginForm-loginForm-email".to_string(),
            password: "#frm-loginForm-loginForm-password".to_string(),
            submit: "#frm-loginForm-loginForm [type='submit']".to_string(),
            generate: "#generate-report".to_string(),
            download: None,
        }
    }
}

fn default_status_cell_index() -> usize {
    3
}

fn default_trigger_params() -> Vec<String> {
    vec!["s".to_string(), "d".to_string(), "l".to_string()]
}

/// 1つのショップ/アカウント
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub login_url: String,
    pub username: String,
    #[serde(rename = "#password")]
    pub password: Secret,
    /// 未指定なら国コードから決まるポータルURL
    #[serde(default)]
    pub report_url: Option<String>,
    pub country: String,
    pub distrchan: String,
    /// ステータス欄の `<td>` 位置 (0始まり)
    #[serde(default = "default_status_cell_index")]
    pub status_cell_index: usize,
    /// 生成リクエストURLに付けるパラメータ名 (順序どおり)
    #[serde(default = "default_trigger_params")]
    pub trigger_params: Vec<String>,
    #[serde(default)]
    pub login_form: LoginForm,
    #[serde(default)]
    pub selectors: BrowserSelectors,
    pub outputs: Vec<OutputSpec>,
}

impl AccountConfig {
    pub fn new(
        name: impl Into<String>,
        login_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            login_url: login_url.into(),
            username: username.into(),
            password: Secret::new(password),
            report_url: None,
            country: String::new(),
            distrchan: String::new(),
            status_cell_index: default_status_cell_index(),
            trigger_params: default_trigger_params(),
            login_form: LoginForm::default(),
            selectors: BrowserSelectors::default(),
            outputs: Vec::new(),
        }
    }

    pub fn with_market(mut self, country: impl Into<String>, distrchan: impl Into<String>) -> Self {
        self.country = country.into();
        self.distrchan = distrchan.into();
        self
    }

    pub fn with_report_url(mut self, url: impl Into<String>) -> Self {
        self.report_url = Some(url.into());
        self
    }

    pub fn with_output(mut self, spec: OutputSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn report_url(&self) -> String {
        self.report_url.clone().unwrap_or_else(|| {
            format!(
                "https://sluzby.heureka.{}/obchody/sortiment-report/",
                self.country.to_lowercase()
            )
        })
    }

    fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(SyncError::Config(format!(
                "account {} has no outputs",
                self.name
            )));
        }
        let mut destinations = HashSet::new();
        for spec in &self.outputs {
            if spec.columns.is_empty() {
                return Err(SyncError::Config(format!(
                    "output {} of account {} has no columns",
                    spec.destination, self.name
                )));
            }
            if !destinations.insert(spec.destination.as_str()) {
                return Err(SyncError::Config(format!(
                    "output {} declared twice for account {}",
                    spec.destination, self.name
                )));
            }
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data/")
}

fn default_source_tag() -> String {
    "heureka".to_string()
}

/// 実行全体の設定
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub auth_failure: AuthPolicy,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `source` 予約列に入る値
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub artifact: ArtifactRule,
    pub accounts: Vec<AccountConfig>,
}

impl RunConfig {
    pub fn new(accounts: Vec<AccountConfig>) -> Self {
        Self {
            strategy: Strategy::default(),
            auth_failure: AuthPolicy::default(),
            data_dir: default_data_dir(),
            source_tag: default_source_tag(),
            http: HttpSettings::default(),
            browser: BrowserSettings::default(),
            artifact: ArtifactRule::default(),
            accounts,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| SyncError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(SyncError::Config("no accounts configured".into()));
        }
        self.accounts.iter().try_for_each(AccountConfig::validate)?;

        // 全アカウントが同じ出力ディレクトリに書く
        let mut owners: HashMap<&str, &str> = HashMap::new();
        for account in &self.accounts {
            for spec in &account.outputs {
                if let Some(owner) =
                    owners.insert(spec.destination.as_str(), account.name.as_str())
                {
                    return Err(SyncError::Config(format!(
                        "output {} is declared by both {} and {}",
                        spec.destination, owner, account.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_auth_policy(mut self, policy: AuthPolicy) -> Self {
        self.auth_failure = policy;
        self
    }

    pub fn with_data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// ダウンロードしたレポートの一時置き場
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("in").join("tables")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("out").join("tables")
    }
}
