//! ポータルとのセッション
//!
//! 取得方法は2種類
//! - [`DirectSession`]: HTTPセッションでフォームを直接送信
//! - [`BrowserSession`]: ヘッドレスブラウザで画面を操作
//!
//! どちらも [`SessionDriver`] を実装し、ダウンロード後は一時ディレクトリに
//! 完全なレポートファイルが置かれる。

mod browser;
mod direct;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{AccountConfig, BrowserSettings, HttpSettings, RunConfig, Strategy};
use crate::error::Result;
use crate::report::ReportParams;

pub use browser::BrowserSession;
pub use direct::DirectSession;

/// セッション状態 (Cookie・ページ) はドライバ自身が保持する
#[async_trait]
pub trait SessionDriver: Send {
    /// ログイン実行
    async fn authenticate(&mut self, account: &AccountConfig) -> Result<()>;

    /// ページを開いてHTMLを返す
    async fn navigate(&mut self, url: &str) -> Result<String>;

    /// 新しいレポートの生成を要求
    async fn trigger_generation(
        &mut self,
        account: &AccountConfig,
        params: &ReportParams,
    ) -> Result<()>;

    /// レポートファイルを一時ディレクトリにダウンロード
    async fn download(&mut self, url: &str) -> Result<PathBuf>;

    /// リソース解放
    async fn close(&mut self) -> Result<()>;
}

/// アカウントごとに新しいセッションを開く
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self, account: &AccountConfig) -> Result<Box<dyn SessionDriver>>;
}

/// 設定された [`Strategy`] のドライバを作る
#[derive(Debug, Clone)]
pub struct StrategyFactory {
    strategy: Strategy,
    http: HttpSettings,
    browser: BrowserSettings,
    scratch_dir: PathBuf,
    extension: String,
}

impl StrategyFactory {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            strategy: config.strategy,
            http: config.http.clone(),
            browser: config.browser.clone(),
            scratch_dir: config.scratch_dir(),
            extension: config.artifact.extension.clone(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

#[async_trait]
impl DriverFactory for StrategyFactory {
    async fn open(&self, account: &AccountConfig) -> Result<Box<dyn SessionDriver>> {
        match self.strategy {
            Strategy::Direct => Ok(Box::new(DirectSession::new(
                self.http.clone(),
                self.scratch_dir.clone(),
            )?)),
            Strategy::Browser => Ok(Box::new(
                BrowserSession::launch(
                    self.browser.clone(),
                    &account.name,
                    self.scratch_dir.clone(),
                    self.extension.clone(),
                )
                .await?,
            )),
        }
    }
}
