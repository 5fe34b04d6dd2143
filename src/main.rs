use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use criteria_query::config::QueryConfig;
use criteria_query::entity::Document;
use criteria_query::expr::{Bindings, Lambda};
use criteria_query::manager::QueryManager;
use criteria_query::value::Value;

const CONFIG_FILE: &str = "criteria_query.json";

const HELP: &str = r#"输入 lambda 表达式，例如：
  x => x.Age > 18 && x.Name.StartsWith("A")
命令：
  :load <file.json>    加载记录（JSON对象数组）
  :bind <name> <json>  定义捕获变量，例如 :bind ids [1, 2, 3]
  :sort [field] [desc] 追加排序字段，不带参数时清空
  :help                显示帮助
  :quit                退出"#;

/// 加载配置，失败时使用默认配置
fn load_config() -> QueryConfig {
    match QueryConfig::from_json_file(CONFIG_FILE) {
        Ok(config) => {
            println!("✅ 成功从JSON配置文件加载配置: {}", CONFIG_FILE);
            config
        }
        Err(e) => {
            println!("⚠️ 无法加载JSON配置文件 ({}), 使用默认配置", e);
            QueryConfig::default()
        }
    }
}

fn init_tracing(config: &QueryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
    Ok(())
}

struct Shell {
    manager: QueryManager,
    bindings: Bindings,
    records: Vec<Document>,
    sorts: Vec<(String, bool)>,
}

impl Shell {
    fn new(config: QueryConfig) -> Self {
        Self {
            manager: QueryManager::from_config(config),
            bindings: Bindings::new(),
            records: Vec::new(),
            sorts: Vec::new(),
        }
    }

    /// 处理一行输入，返回 false 表示退出
    fn handle(&mut self, line: &str) -> Result<bool> {
        let Some(command) = line.strip_prefix(':') else {
            self.run_lambda(line)?;
            return Ok(true);
        };

        let mut parts = command.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();
        match name {
            "quit" | "q" => return Ok(false),
            "help" | "h" => println!("{HELP}"),
            "load" => self.load(rest)?,
            "bind" => self.bind(rest)?,
            "sort" => self.sort(rest),
            other => println!("✗ 未知命令: :{other}"),
        }
        Ok(true)
    }

    fn load(&mut self, path: &str) -> Result<()> {
        let content =
            fs::read_to_string(path).with_context(|| format!("无法读取记录文件 {path}"))?;
        self.records =
            serde_json::from_str(&content).with_context(|| format!("无法解析记录文件 {path}"))?;
        println!("✓ 加载了 {} 条记录", self.records.len());
        Ok(())
    }

    fn bind(&mut self, input: &str) -> Result<()> {
        let (name, raw) = input
            .split_once(char::is_whitespace)
            .context("用法: :bind <name> <json>")?;
        let raw = raw.trim();
        // 非JSON的值按字符串处理
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(raw));
        println!("✓ {name} = {value}");
        self.bindings.insert(name.to_string(), value);
        Ok(())
    }

    fn sort(&mut self, input: &str) {
        let mut parts = input.split_whitespace();
        match parts.next() {
            Some(field) => {
                let desc = parts.next().is_some_and(|dir| dir.eq_ignore_ascii_case("desc"));
                self.sorts.push((field.to_string(), desc));
            }
            None => self.sorts.clear(),
        }
        println!("✓ 排序: {:?}", self.sorts);
    }

    fn run_lambda(&self, text: &str) -> Result<()> {
        let lambda = Lambda::parse_with(text, &self.bindings)?;
        debug!(%lambda, "lambda parsed");

        let mut query = self.manager.create();
        query.and_expr(&lambda)?;
        for (field, desc) in &self.sorts {
            query.order_by(field, *desc, None);
        }

        println!("[条件]: {query}");
        println!("[JSON]:\n{}", serde_json::to_string_pretty(&query)?);

        if self.records.is_empty() {
            return Ok(());
        }
        let mut matched: Vec<Document> = query.filter(&self.records).into_iter().cloned().collect();
        query.sort(&mut matched);
        println!("[匹配 {}/{}]:", matched.len(), self.records.len());
        for record in &matched {
            println!("  {record}");
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    println!("--- Criteria Query: lambda 到条件树 ---");
    let config = load_config();
    init_tracing(&config)?;

    let mut shell = Shell::new(config);
    let mut editor = DefaultEditor::new()?;
    println!("{HELP}");

    loop {
        match editor.readline("query> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                match shell.handle(line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!(error = %e, "command failed");
                        println!("✗ {e:#}");
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
