use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, BrowserSettings};
use crate::error::{Result, SyncError};
use crate::report::ReportParams;

use super::SessionDriver;

const DOWNLOAD_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ヘッドレスブラウザのセッション
///
/// Chromiumプロセスの終了は `close()` で行う。パイプラインは結果に関わらず
/// 必ず `close()` を呼ぶ。`close()` されずに破棄された場合は、イベント処理
/// タスクの停止とプロファイルディレクトリの削除だけを行い警告を出す。
pub struct BrowserSession {
    settings: BrowserSettings,
    browser: Option<Browser>,
    page: Option<Page>,
    handler_task: Option<JoinHandle<()>>,
    dialog_task: Option<JoinHandle<()>>,
    download_dir: PathBuf,
    user_data_dir: PathBuf,
    extension: String,
    download_selector: Option<String>,
}

impl BrowserSession {
    /// ブラウザを起動し、ダウンロード先とダイアログ自動承認を設定する
    pub async fn launch(
        settings: BrowserSettings,
        account_name: &str,
        download_dir: PathBuf,
        extension: String,
    ) -> Result<Self> {
        info!(account = %account_name, "Initializing browser...");

        std::fs::create_dir_all(&download_dir)?;
        let download_dir = download_dir
            .canonicalize()
            .unwrap_or_else(|_| download_dir.clone());

        // アカウントごとにユーザーデータを分ける
        let unique_id = format!(
            "{}-{}-{}",
            sanitize(account_name),
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("sortiment-sync-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .chrome_executable(settings.chrome_executable())
            .user_data_dir(&user_data_dir)
            .window_size(settings.viewport_width, settings.viewport_height)
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if !settings.headless {
            builder = builder.with_head();
        }

        let config = builder
            .build()
            .map_err(|e| SyncError::BrowserInit(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SyncError::BrowserInit(e.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("Browser event: {:?}", event);
            }
        });

        let mut session = Self {
            settings,
            browser: Some(browser),
            page: None,
            handler_task: Some(handler_task),
            dialog_task: None,
            download_dir,
            user_data_dir,
            extension,
            download_selector: None,
        };

        // 途中で失敗しても close() でブラウザを終了させる
        if let Err(e) = session.open_page().await {
            if let Err(close_err) = session.close().await {
                warn!(error = %close_err, "Failed to close browser after init error");
            }
            return Err(e);
        }

        info!("Browser initialized");
        Ok(session)
    }

    async fn open_page(&mut self) -> Result<()> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| SyncError::BrowserInit("browser not running".into()))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| SyncError::BrowserInit(e.to_string()))?;

        let download_params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(self.download_dir.to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(|e| SyncError::BrowserInit(format!("download behavior: {}", e)))?;
        page.execute(download_params)
            .await
            .map_err(|e| SyncError::BrowserInit(format!("download behavior: {}", e)))?;

        // confirm() などのネイティブダイアログはすべて承認する
        let mut dialogs = page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .map_err(|e| SyncError::BrowserInit(e.to_string()))?;
        let dialog_page = page.clone();
        self.dialog_task = Some(tokio::spawn(async move {
            while let Some(event) = dialogs.next().await {
                info!(message = %event.message, "Accepting dialog");
                if let Err(e) = dialog_page
                    .execute(HandleJavaScriptDialogParams::new(true))
                    .await
                {
                    warn!(error = %e, "Failed to accept dialog");
                }
            }
        }));

        self.page = Some(page);
        Ok(())
    }

    fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| SyncError::BrowserInit("ブラウザが初期化されていません".into()))
    }

    async fn debug_screenshot(&self, page: &Page, label: &str) {
        if !self.settings.debug {
            return;
        }
        match page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
        {
            Ok(screenshot) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&screenshot);
                debug!("{} screenshot: data:image/png;base64,{}", label, encoded);
            }
            Err(e) => debug!(error = %e, "Failed to take screenshot"),
        }
    }

    /// 条件付きで隠れているダウンロードボタンを表示させる
    async fn resize_viewport(&self, page: &Page) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::new(
            i64::from(self.settings.viewport_width),
            i64::from(self.settings.viewport_height),
            1.0,
            false,
        );
        page.execute(params)
            .await
            .map_err(|e| SyncError::Navigation(format!("viewport resize: {}", e)))?;
        Ok(())
    }

    async fn click_download(&self, page: &Page, url: &str) -> Result<()> {
        if let Some(selector) = &self.download_selector {
            page.find_element(selector.as_str())
                .await
                .map_err(|e| SyncError::ElementNotFound(format!("{}: {}", selector, e)))?
                .click()
                .await
                .map_err(|e| SyncError::Download(format!("download click: {}", e)))?;
            return Ok(());
        }

        let target = serde_json::to_string(url)
            .map_err(|e| SyncError::JavaScript(e.to_string()))?;
        let script = format!(
            r#"
            (function(target) {{
                var links = document.querySelectorAll('a[href]');
                for (var i = 0; i < links.length; i++) {{
                    if (links[i].href === target || links[i].getAttribute('href') === target) {{
                        links[i].click();
                        return true;
                    }}
                }}
                return false;
            }})({})
            "#,
            target
        );

        let clicked: bool = page
            .evaluate(script.as_str())
            .await
            .map_err(|e| SyncError::JavaScript(e.to_string()))?
            .into_value()
            .unwrap_or(false);

        if !clicked {
            return Err(SyncError::ElementNotFound(format!("download link {}", url)));
        }
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// ダウンロード済み (.crdownload でない) のファイルを探す
fn find_completed_download(dir: &Path, extension: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
}

async fn wait_for_download(dir: &Path, extension: &str, timeout: Duration) -> Result<PathBuf> {
    let start = Instant::now();

    loop {
        if let Some(path) = find_completed_download(dir, extension) {
            info!(path = ?path, "Report file detected");
            return Ok(path);
        }

        if start.elapsed() > timeout {
            return Err(SyncError::Timeout(format!(
                "download did not finish within {}s",
                timeout.as_secs()
            )));
        }

        sleep(DOWNLOAD_POLL_INTERVAL).await;
    }
}

#[async_trait]
impl SessionDriver for BrowserSession {
    async fn authenticate(&mut self, account: &AccountConfig) -> Result<()> {
        let page = self.page()?.clone();
        let selectors = &account.selectors;
        info!(login_url = %account.login_url, user = %account.username, "Logging in");

        page.goto(account.login_url.as_str())
            .await
            .map_err(|e| SyncError::Navigation(e.to_string()))?;
        if let Err(e) = page.wait_for_navigation().await {
            debug!(error = %e, "Navigation wait failed");
        }

        page.find_element(selectors.username.as_str())
            .await
            .map_err(|e| SyncError::Login(format!("username field {}: {}", selectors.username, e)))?
            .click()
            .await
            .map_err(|e| SyncError::Login(format!("username field: {}", e)))?
            .type_str(&account.username)
            .await
            .map_err(|e| SyncError::Login(format!("username input: {}", e)))?;

        page.find_element(selectors.password.as_str())
            .await
            .map_err(|e| SyncError::Login(format!("password field {}: {}", selectors.password, e)))?
            .click()
            .await
            .map_err(|e| SyncError::Login(format!("password field: {}", e)))?
            .type_str(account.password.expose())
            .await
            .map_err(|e| SyncError::Login(format!("password input: {}", e)))?;

        self.debug_screenshot(&page, "Login").await;

        page.find_element(selectors.submit.as_str())
            .await
            .map_err(|e| SyncError::Login(format!("submit button {}: {}", selectors.submit, e)))?
            .click()
            .await
            .map_err(|e| SyncError::Login(format!("submit click: {}", e)))?;

        if let Err(e) = page.wait_for_navigation().await {
            debug!(error = %e, "Navigation wait after login failed");
        }

        self.download_selector = selectors.download.clone();
        info!("Login submitted");
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<String> {
        let page = self.page()?.clone();

        page.goto(url)
            .await
            .map_err(|e| SyncError::Navigation(e.to_string()))?;
        if let Err(e) = page.wait_for_navigation().await {
            debug!(error = %e, "Navigation wait failed");
        }

        page.content()
            .await
            .map_err(|e| SyncError::Navigation(e.to_string()))
    }

    async fn trigger_generation(
        &mut self,
        account: &AccountConfig,
        params: &ReportParams,
    ) -> Result<()> {
        let page = self.page()?.clone();
        debug!(params = ?params.keys().collect::<Vec<_>>(), "Generate via page control");

        let control = match page.find_element(account.selectors.generate.as_str()).await {
            Ok(control) => control,
            Err(e) => {
                // 直近で生成済みのためボタンが表示されていない
                info!(
                    selector = %account.selectors.generate,
                    reason = %e,
                    "Generate control not present, report was triggered recently"
                );
                return Ok(());
            }
        };

        control
            .click()
            .await
            .map_err(|e| SyncError::Navigation(format!("generate click: {}", e)))?;
        sleep(self.settings.settle_delay()).await;

        info!("Report generation requested");
        Ok(())
    }

    async fn download(&mut self, url: &str) -> Result<PathBuf> {
        let page = self.page()?.clone();
        info!(url = %url, "Downloading last available report");

        self.resize_viewport(&page).await?;
        sleep(self.settings.settle_delay()).await;
        self.click_download(&page, url).await?;

        wait_for_download(
            &self.download_dir,
            &self.extension,
            self.settings.download_timeout(),
        )
        .await
    }

    async fn close(&mut self) -> Result<()> {
        info!("ブラウザを終了中...");

        if let Some(task) = self.dialog_task.take() {
            task.abort();
        }
        self.page = None;

        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Failed to close browser");
            }
            if let Err(e) = browser.wait().await {
                debug!(error = %e, "Failed to wait for browser exit");
            }
        }

        if let Some(task) = self.handler_task.take() {
            task.abort();
        }

        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(error = %e, "Failed to remove browser profile");
        }

        info!("ブラウザ終了完了");
        Ok(())
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if self.browser.is_some() {
            warn!("Browser session dropped without close()");
        }
        if let Some(task) = self.dialog_task.take() {
            task.abort();
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if self.user_data_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
                debug!(error = %e, "Failed to remove browser profile");
            }
        }
    }
}
