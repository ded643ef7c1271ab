//! レポートページの解析
//!
//! - 生成中かどうかの判定 (state)
//! - 生成リクエスト用パラメータの抽出 (params)
//! - 最新レポートファイルの特定 (locator)

mod locator;
mod params;
mod state;

pub use locator::{locate_artifact, Artifact, ArtifactRule, ArtifactSelection};
pub use params::{extract_params, ReportParams};
pub use state::{detect_state, find_status_fragment, ReportState, STATUS_TIMESTAMP_FORMAT};
