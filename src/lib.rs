//! ソーティメントレポート同期ライブラリ
//!
//! - ポータルにログインし、レポートが生成中でなければ新しい生成を要求
//! - 最新のレポートCSVをダウンロード
//! - 出力先ごとの列マッピングでCSVを書き出す
//!
//! # 使用例
//!
//! ```rust,ignore
//! use sortiment_sync::{RunConfig, SyncPipeline};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RunConfig::from_file("config.json").unwrap();
//!     let pipeline = SyncPipeline::new(config);
//!
//!     let report = pipeline.run().await;
//!     for outcome in &report.accounts {
//!         println!("{}: {:?}", outcome.account, outcome.result.is_ok());
//!     }
//! }
//! ```
//!
//! # tower::Service として使う
//!
//! ```rust,ignore
//! use sortiment_sync::{SyncPipeline, SyncRequest, SyncService};
//! use tower::Service;
//!
//! let mut service = SyncService::new(SyncPipeline::new(config.clone()));
//! let report = service.call(SyncRequest::new(config.accounts[0].clone())).await?;
//! println!("outputs: {:?}", report.outputs);
//! ```

pub mod config;
pub mod error;
pub mod mapping;
pub mod output;
pub mod pipeline;
pub mod report;
pub mod service;
pub mod session;

// 主要な型をリエクスポート
pub use config::{AccountConfig, AuthPolicy, RunConfig, Secret, Strategy};
pub use error::{Result, SyncError};
pub use mapping::{ColumnMapping, FieldMapper, InjectedFields, OutputSpec};
pub use output::{OutputMode, OutputSummary};
pub use pipeline::{AccountOutcome, AccountReport, RunReport, SyncPipeline};
pub use report::{Artifact, ArtifactRule, ArtifactSelection, ReportParams, ReportState};
pub use service::{SyncRequest, SyncService};
pub use session::{BrowserSession, DirectSession, DriverFactory, SessionDriver, StrategyFactory};
