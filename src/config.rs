//! 配置模块，负责加载JSON配置文件

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置文件不存在: {0}")]
    NotFound(String),

    #[error("无法读取配置文件 {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("无法解析JSON配置文件 {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// 查询层配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// 作为参数传入的查询（子查询、关联目标、嵌套条件）是否先复制再挂载
    pub copy_parameter_queries: bool,
    /// 日志过滤级别，`RUST_LOG` 未设置时使用
    pub log_level: String,
}

impl Default for QueryConfig {
    /// 创建默认配置（用于测试或fallback）
    fn default() -> Self {
        Self {
            copy_parameter_queries: true,
            log_level: "info".to_string(),
        }
    }
}

impl QueryConfig {
    /// 从JSON文件加载配置，缺省的字段取默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let display = path_ref.display().to_string();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::NotFound(display));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        // 解析JSON
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }
}
