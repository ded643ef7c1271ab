use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("設定エラー: {0}")]
    Config(String),

    #[error("ブラウザ初期化エラー: {0}")]
    BrowserInit(String),

    #[error("ナビゲーションエラー: {0}")]
    Navigation(String),

    #[error("ログインエラー: {0}")]
    Login(String),

    #[error("HTTPエラー: status={status} url={url}")]
    Http { status: u16, url: String },

    #[error("HTTP通信エラー: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("JavaScript実行エラー: {0}")]
    JavaScript(String),

    #[error("ダウンロードエラー: {0}")]
    Download(String),

    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("要素が見つかりません: {0}")]
    ElementNotFound(String),

    #[error("リクエストパラメータがありません: {0}")]
    MissingParameter(String),

    #[error("レポートファイルが見つかりません: {0}")]
    ArtifactNotFound(String),

    #[error("CSVエラー: {0}")]
    Csv(#[from] csv::Error),

    #[error("ファイル操作エラー: {0}")]
    FileIO(#[from] std::io::Error),
}

impl SyncError {
    /// リトライで回復しうるエラーか。HTTPステータスは `retry_statuses` に含まれるもののみ
    pub fn is_retryable(&self, retry_statuses: &[u16]) -> bool {
        match self {
            SyncError::Http { status, .. } => retry_statuses.contains(status),
            SyncError::Transport(e) => e.is_timeout() || e.is_connect(),
            SyncError::Timeout(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
