/*
 * Meeting Minutes Pipeline - Template Resolver
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use serde_json::Value;

use crate::error::{PipelineError, PipelineResult};

lazy_static! {
    static ref PRESETS: HashMap<&'static str, &'static str> = {
        let mut presets = HashMap::new();
        presets.insert(
            "default",
            "你是一名专业的会议纪要撰写助手。请根据会议内容生成结构化的 Markdown 会议纪要,\
             包含以下部分:# 会议主题、## 参会人员、## 讨论要点、## 决策事项、## 行动项(负责人与截止时间)。\
             保持客观,不要编造内容;没有信息的部分写\"无\"。",
        );
        presets.insert(
            "standup",
            "你是一名敏捷教练。请将站会内容整理为 Markdown:按发言人列出昨日进展、今日计划、阻塞问题,\
             最后汇总需要跟进的风险。保持简洁。",
        );
        presets.insert(
            "review",
            "你是一名评审会议记录员。请生成 Markdown 纪要:# 评审对象、## 评审结论(通过/有条件通过/不通过)、\
             ## 主要问题列表(编号)、## 修改要求与责任人。结论必须能从发言中直接支持。",
        );
        presets.insert(
            "interview",
            "你是一名招聘面试记录助手。请整理 Markdown 纪要:# 候选人与岗位、## 面试官提问与候选人回答要点、\
             ## 亮点、## 风险与疑虑、## 建议(推进/备选/不推进)。不得虚构评价。",
        );
        presets
    };
}

/// The prompt handed to the LLM orchestrator.
#[derive(Debug, Clone)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Rough token estimate: ASCII text at ~4 characters per token, CJK and
/// other wide characters at one token each.
pub fn estimate_tokens(text: &str) -> usize {
    let mut ascii = 0usize;
    let mut wide = 0usize;
    for c in text.chars() {
        if c.is_ascii() {
            ascii += 1;
        } else {
            wide += 1;
        }
    }
    ascii / 4 + wide
}

/// Interprets the request's `template` field and assembles the final
/// prompt pair.
pub struct TemplateResolver {
    template_dir: PathBuf,
    max_prompt_tokens: usize,
}

impl TemplateResolver {
    pub fn new(template_dir: impl Into<PathBuf>, max_prompt_tokens: usize) -> Self {
        Self {
            template_dir: template_dir.into(),
            max_prompt_tokens,
        }
    }

    /// Resolution order: preset id, then existing file with a supported
    /// extension, then inline JSON with a `prompt` key, then the string
    /// itself as the system prompt.
    pub fn resolve(&self, template: &str) -> PipelineResult<String> {
        let template = template.trim();
        if template.is_empty() {
            return self.resolve("default");
        }

        if let Some(preset) = PRESETS.get(template) {
            return Ok((*preset).to_string());
        }

        if let Some(path) = self.existing_template_path(template) {
            return self.load_file(&path);
        }

        if template.starts_with('{') {
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(template) {
                if let Some(prompt) = object.get("prompt").and_then(|p| p.as_str()) {
                    let mut system = prompt.to_string();
                    if let Some(format) = object.get("format").and_then(|f| f.as_str()) {
                        system.push_str("\n输出格式要求:");
                        system.push_str(format);
                    }
                    return Ok(system);
                }
            }
        }

        Ok(template.to_string())
    }

    fn existing_template_path(&self, template: &str) -> Option<PathBuf> {
        let candidate = Path::new(template);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.template_dir.join(candidate)
        };
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "txt" | "md" | "json"))
            .unwrap_or(false);
        (supported && path.is_file()).then_some(path)
    }

    fn load_file(&self, path: &Path) -> PipelineResult<String> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::BadInput(format!("cannot read template {}: {e}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            let parsed: Value = serde_json::from_str(&text).map_err(|e| {
                PipelineError::BadInput(format!("template {} is not valid JSON: {e}", path.display()))
            })?;
            return parsed
                .get("prompt")
                .and_then(|p| p.as_str())
                .map(|p| p.to_string())
                .ok_or_else(|| {
                    PipelineError::BadInput(format!(
                        "template {} has no 'prompt' key",
                        path.display()
                    ))
                });
        }
        Ok(text.trim().to_string())
    }

    /// User section: transcript, then optional history, then the optional
    /// user requirement. Oversized prompts fail before the LLM is called.
    pub fn build_prompt(
        &self,
        system: &str,
        transcript: &str,
        history: &str,
        user_requirement: Option<&str>,
    ) -> PipelineResult<PromptPair> {
        let mut user = String::from("以下是会议内容:\n\n");
        user.push_str(transcript);
        if !history.is_empty() {
            user.push_str("\n\n## 历史会议参考\n");
            user.push_str(history);
        }
        if let Some(requirement) = user_requirement.filter(|r| !r.trim().is_empty()) {
            user.push_str("\n\n## 用户要求\n");
            user.push_str(requirement.trim());
        }

        let estimated = estimate_tokens(system) + estimate_tokens(&user);
        if estimated > self.max_prompt_tokens {
            return Err(PipelineError::ContextLength(format!(
                "estimated {estimated} tokens exceeds the {} token limit",
                self.max_prompt_tokens
            )));
        }

        Ok(PromptPair {
            system: system.to_string(),
            user,
        })
    }
}
