//! Prompt 模板库
//!
//! 内置各智能体的默认模板；可由 config/prompts.toml 按 `[智能体] 名称 = "..."` 覆盖单条模板。
//! 渲染时替换 `{name}` 形式的占位符，`{date}` 默认填当天日期。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::ResearchError;

/// 模板标识：(智能体, 名称)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    Clarify,
    ResearchBrief,
    Supervisor,
    Researcher,
    CompressSystem,
    CompressHuman,
    FinalReport,
}

impl PromptKey {
    pub const ALL: [PromptKey; 7] = [
        PromptKey::Clarify,
        PromptKey::ResearchBrief,
        PromptKey::Supervisor,
        PromptKey::Researcher,
        PromptKey::CompressSystem,
        PromptKey::CompressHuman,
        PromptKey::FinalReport,
    ];

    /// TOML 中的 (表名, 键名)
    pub fn path(&self) -> (&'static str, &'static str) {
        match self {
            PromptKey::Clarify => ("scope", "clarify"),
            PromptKey::ResearchBrief => ("scope", "research_brief"),
            PromptKey::Supervisor => ("supervisor", "lead_researcher"),
            PromptKey::Researcher => ("researcher", "research_agent"),
            PromptKey::CompressSystem => ("researcher", "compress_system"),
            PromptKey::CompressHuman => ("researcher", "compress_human"),
            PromptKey::FinalReport => ("reporter", "final_report"),
        }
    }

    fn default_template(&self) -> &'static str {
        match self {
            PromptKey::Clarify => DEFAULT_CLARIFY,
            PromptKey::ResearchBrief => DEFAULT_BRIEF,
            PromptKey::Supervisor => DEFAULT_SUPERVISOR,
            PromptKey::Researcher => DEFAULT_RESEARCHER,
            PromptKey::CompressSystem => DEFAULT_COMPRESS_SYSTEM,
            PromptKey::CompressHuman => DEFAULT_COMPRESS_HUMAN,
            PromptKey::FinalReport => DEFAULT_FINAL_REPORT,
        }
    }
}

const DEFAULT_CLARIFY: &str = "\
Today's date is {date}.
These are the messages exchanged so far with the user who asked for a research report:
<Messages>
{messages}
</Messages>

Decide whether you need to ask the user one clarifying question before research can start.
Ask only when the request is ambiguous, uses unexplained acronyms, or lacks essential scope.
If you already asked a clarifying question and the user answered, do not ask again.
If clarification is needed, set need_clarification to true and put the question in `question`.
Otherwise set need_clarification to false and put a short acknowledgement in `verification`
that restates what you will research.";

const DEFAULT_BRIEF: &str = "\
Today's date is {date}.
Turn the conversation below into one detailed research brief written in the first person
from the user's perspective. Keep every constraint the user stated, mark unstated dimensions
as open, and prefer primary sources.
<Messages>
{messages}
</Messages>";

const DEFAULT_SUPERVISOR: &str = "\
You are a research supervisor. Today's date is {date}.
Your job is to gather enough information to answer the research brief by delegating
focused topics to sub-agents with `delegate_research`.

Guidelines:
- Call `memory_lookup` first: earlier reports may already answer the brief.
- Use `reflect` after each batch of results to assess gaps before delegating again.
- You may request at most {max_concurrent} `delegate_research` actions in one turn.
- Stop after at most {max_iterations} turns of delegation and reflection.
- Call `research_complete` as soon as the findings are sufficient.
- Each delegated topic must be self-contained; sub-agents cannot see each other's work.";

const DEFAULT_RESEARCHER: &str = "\
You are a research assistant investigating one topic. Today's date is {date}.
Use `search` to gather information and `reflect` after each search to note what you found
and what is still missing. Start broad, then narrow down. Stop calling actions once you can
answer the topic comprehensively or after a handful of searches with no new information.";

const DEFAULT_COMPRESS_SYSTEM: &str = "\
You have conducted research on a topic by calling tools. Today's date is {date}.
Clean up the findings: keep every relevant fact and source verbatim, remove duplicates and
irrelevant material, and list the sources you used at the end.";

const DEFAULT_COMPRESS_HUMAN: &str = "\
All research above was conducted for the topic. Produce the cleaned-up findings now,
preserving all relevant statements and their sources.";

const DEFAULT_FINAL_REPORT: &str = "\
Based on all the research conducted, write a comprehensive, well-structured answer to the brief.
Today's date is {date}.
<Research Brief>
{research_brief}
</Research Brief>

<Findings>
{findings}
</Findings>

Use Markdown headings, cite sources inline as [n] and finish with a Sources section.";

/// config/prompts.toml 的结构：表名 -> (键 -> 模板)
#[derive(Debug, Default, Deserialize)]
#[serde(transparent)]
struct PromptFile(HashMap<String, HashMap<String, String>>);

/// Prompt 模板库
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    overrides: HashMap<PromptKey, String>,
}

impl PromptLibrary {
    /// 仅使用内置模板
    pub fn builtin() -> Self {
        Self::default()
    }

    /// 解析 TOML 文本中的覆盖模板；未知键被忽略并记录日志
    pub fn from_toml_str(text: &str) -> Result<Self, ResearchError> {
        let file: PromptFile =
            toml::from_str(text).map_err(|e| ResearchError::Config(format!("prompts: {e}")))?;
        let mut overrides = HashMap::new();
        for key in PromptKey::ALL {
            let (table, name) = key.path();
            if let Some(template) = file.0.get(table).and_then(|t| t.get(name)) {
                overrides.insert(key, template.clone());
            }
        }
        for (table, entries) in &file.0 {
            for name in entries.keys() {
                if !PromptKey::ALL.iter().any(|k| k.path() == (table.as_str(), name.as_str())) {
                    tracing::warn!(table = %table, name = %name, "unknown prompt override ignored");
                }
            }
        }
        Ok(Self { overrides })
    }

    /// 加载覆盖文件：显式路径优先，其次 config/prompts.toml、../config/prompts.toml；都不存在时用内置模板
    pub fn load(path: Option<&Path>) -> Result<Self, ResearchError> {
        let candidates: Vec<PathBuf> = match path {
            Some(p) => vec![p.to_path_buf()],
            None => vec![
                PathBuf::from("config/prompts.toml"),
                PathBuf::from("../config/prompts.toml"),
            ],
        };
        for candidate in candidates {
            if candidate.exists() {
                let text = std::fs::read_to_string(&candidate)
                    .map_err(|e| ResearchError::Config(format!("{}: {e}", candidate.display())))?;
                tracing::info!(path = %candidate.display(), "loaded prompt overrides");
                return Self::from_toml_str(&text);
            }
        }
        Ok(Self::builtin())
    }

    pub fn template(&self, key: PromptKey) -> &str {
        self.overrides
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| key.default_template())
    }

    /// 渲染模板：替换 vars 中的占位符，{date} 缺省为当天
    pub fn render(&self, key: PromptKey, vars: &[(&str, &str)]) -> String {
        let mut out = self.template(key).to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        if out.contains("{date}") {
            out = out.replace("{date}", &today());
        }
        out
    }
}

/// 当天日期（如 "Mon Oct 19, 2026"）
pub fn today() -> String {
    chrono::Local::now().format("%a %b %-d, %Y").to_string()
}
