//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DELVE__*` 覆盖（双下划线表示嵌套，如 `DELVE__RESEARCH__MAX_ITERATIONS=4`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub research: ResearchSection,
    pub memory: MemorySection,
    pub storage: StorageSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、Prompt 覆盖文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// Prompt 覆盖文件（TOML），未设置时尝试 config/prompts.toml
    pub prompts_path: Option<PathBuf>,
}

/// [llm] 段：后端选择、重试与按智能体路由模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 结构化输出解析失败时的纠正重试次数
    #[serde(default = "default_structured_retries")]
    pub structured_retries: usize,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub routing: RoutingSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: None,
            structured_retries: default_structured_retries(),
            retry: RetrySection::default(),
            routing: RoutingSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_structured_retries() -> usize {
    1
}

/// [llm.retry] 段：瞬时错误的有界指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

/// [llm.routing] 段：各智能体可单独指定模型，未设置时使用 llm.model
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingSection {
    pub scope: Option<String>,
    pub supervisor: Option<String>,
    pub researcher: Option<String>,
    pub reporter: Option<String>,
}

/// [research] 段：监督循环与子研究的上限
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchSection {
    /// 监督者决策步数上限（research_iterations 的上界）
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 写入监督者 Prompt 的并发子研究建议上限（非硬性信号量）
    #[serde(default = "default_max_concurrent_researchers")]
    pub max_concurrent_researchers: u32,
    /// 子研究 think/act 步数上限；未设置时等于 max_iterations
    pub researcher_max_steps: Option<u32>,
    /// 是否允许澄清阶段向用户追问
    #[serde(default = "default_true")]
    pub allow_clarification: bool,
}

impl Default for ResearchSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_concurrent_researchers: default_max_concurrent_researchers(),
            researcher_max_steps: None,
            allow_clarification: true,
        }
    }
}

impl ResearchSection {
    pub fn researcher_steps(&self) -> u32 {
        self.researcher_max_steps.unwrap_or(self.max_iterations)
    }
}

fn default_max_iterations() -> u32 {
    6
}

fn default_max_concurrent_researchers() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// [memory] 段：记忆检索短路与报告回写
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 最佳距离不大于此值视为命中
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// 命中时清除 trigger_search
    #[serde(default = "default_true")]
    pub clear_trigger_on_hit: bool,
    /// trigger_search 为 false 时跳过委派研究
    #[serde(default = "default_true")]
    pub suppress_delegation_on_hit: bool,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// 向量索引 JSON 快照；未设置时仅驻留内存
    pub snapshot_path: Option<PathBuf>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_threshold: default_distance_threshold(),
            top_k: default_top_k(),
            clear_trigger_on_hit: true,
            suppress_delegation_on_hit: true,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            snapshot_path: None,
            embedding_model: default_embedding_model(),
        }
    }
}

fn default_distance_threshold() -> f32 {
    0.30
}

fn default_top_k() -> usize {
    10
}

fn default_chunk_size() -> usize {
    1800
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// [storage] 段：检查点与任务台账的 SQLite 路径；未设置时使用内存实现
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    pub checkpoint_db: Option<PathBuf>,
    pub ledger_db: Option<PathBuf>,
}

/// [tools] 段：工具超时与搜索
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            search: SearchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.search] 段：Tavily 搜索
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    /// 未设置时读取环境变量 TAVILY_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_search_endpoint(),
            max_results: default_max_results(),
            timeout_secs: default_search_timeout_secs(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

fn default_search_endpoint() -> String {
    "https://api.tavily.com/search".to_string()
}

fn default_max_results() -> usize {
    3
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

/// 从 config 目录加载配置，环境变量 DELVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DELVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DELVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
