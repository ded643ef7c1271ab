use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{NaiveDate, Utc};
use tower::Service;
use tracing::info;

use crate::config::AccountConfig;
use crate::error::SyncError;
use crate::pipeline::{AccountReport, SyncPipeline};

/// 1アカウント分の同期リクエスト
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub account: AccountConfig,
    pub ingested_on: NaiveDate,
}

impl SyncRequest {
    pub fn new(account: AccountConfig) -> Self {
        Self {
            account,
            ingested_on: Utc::now().date_naive(),
        }
    }

    /// 複数リクエストで同じ取込日付を使う場合
    pub fn with_ingested_on(mut self, date: NaiveDate) -> Self {
        self.ingested_on = date;
        self
    }
}

/// tower::Serviceを実装した同期サービス
#[derive(Clone)]
pub struct SyncService {
    pipeline: Arc<SyncPipeline>,
}

impl SyncService {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

impl Service<SyncRequest> for SyncService {
    type Response = AccountReport;
    type Error = SyncError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SyncRequest) -> Self::Future {
        info!(account = %req.account.name, "Sync request received");
        let pipeline = Arc::clone(&self.pipeline);

        Box::pin(async move {
            let report = pipeline
                .sync_account(&req.account, req.ingested_on)
                .await?;

            info!(
                account = %req.account.name,
                outputs = report.outputs.len(),
                "Sync request finished"
            );
            Ok(report)
        })
    }
}
