//! Host command namespace.
//!
//! A single store shared by the host console and every VM instance. Lookups
//! clone the command handle out of the lock before running it, so a command
//! may add or remove commands (directly or through a module) while it runs.
use crate::config::types::{Result, VmError};
use crate::services::cvar::CvarStore;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Where a running command sends its side effects.
pub trait CommandEnvironment: Send + Sync {
    fn print(&self, text: &str);
    fn execute_after(&self, command: &str, parse_cvars: bool);
}

pub trait Command: Send + Sync {
    fn run(&self, args: &[String], env: &Arc<dyn CommandEnvironment>) -> Result<()>;
}

impl<F> Command for F
where
    F: Fn(&[String], &Arc<dyn CommandEnvironment>) -> Result<()> + Send + Sync,
{
    fn run(&self, args: &[String], env: &Arc<dyn CommandEnvironment>) -> Result<()> {
        self(args, env)
    }
}

struct Entry {
    command: Arc<dyn Command>,
    description: String,
    owner: Option<String>,
}

struct Deferred {
    text: String,
    parse_cvars: bool,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, Entry>>,
    deferred: Mutex<VecDeque<Deferred>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Names are case-insensitive and must be unused.
    pub fn add(
        &self,
        name: &str,
        description: &str,
        owner: Option<&str>,
        command: Arc<dyn Command>,
    ) -> Result<()> {
        let key = normalize(name);
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(VmError::Config(format!("invalid command name: {:?}", name)));
        }
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        if commands.contains_key(&key) {
            return Err(VmError::Config(format!("command {} already registered", name)));
        }
        commands.insert(
            key,
            Entry {
                command,
                description: description.to_string(),
                owner: owner.map(str::to_string),
            },
        );
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        commands.remove(&normalize(name)).is_some()
    }

    /// Remove `name` only if `owner` registered it.
    pub fn remove_if_owned(&self, name: &str, owner: &str) -> bool {
        let key = normalize(name);
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        if commands.get(&key).is_some_and(|e| e.owner.as_deref() == Some(owner)) {
            commands.remove(&key);
            true
        } else {
            false
        }
    }

    /// Remove every command registered by `owner` in one step.
    pub fn remove_owned(&self, owner: &str) -> usize {
        let mut commands = self.commands.write().unwrap_or_else(|e| e.into_inner());
        let before = commands.len();
        commands.retain(|_, entry| entry.owner.as_deref() != Some(owner));
        before - commands.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
        commands.contains_key(&normalize(name))
    }

    /// `(name, description)` pairs in name order
    pub fn list(&self) -> Vec<(String, String)> {
        let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
        commands
            .iter()
            .map(|(name, entry)| (name.clone(), entry.description.clone()))
            .collect()
    }

    /// Run one or more `;`-separated commands.
    pub fn execute(&self, text: &str, env: &Arc<dyn CommandEnvironment>) -> Result<()> {
        for line in split_commands(text) {
            let args = tokenize(&line);
            if !args.is_empty() {
                self.execute_args(&args, env)?;
            }
        }
        Ok(())
    }

    pub fn execute_args(&self, args: &[String], env: &Arc<dyn CommandEnvironment>) -> Result<()> {
        let Some(name) = args.first() else {
            return Ok(());
        };
        let command = {
            let commands = self.commands.read().unwrap_or_else(|e| e.into_inner());
            commands.get(&normalize(name)).map(|e| e.command.clone())
        };
        match command {
            Some(command) => command.run(args, env),
            None => Err(VmError::UnknownCommand(name.clone())),
        }
    }

    /// Queue text for the next `run_deferred` pass.
    pub fn defer(&self, text: &str, parse_cvars: bool) {
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred.push_back(Deferred {
            text: text.to_string(),
            parse_cvars,
        });
    }

    pub fn pending_deferred(&self) -> usize {
        self.deferred.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drain the deferred queue. Failures are reported to `env` and do not
    /// stop the remaining commands. Returns how many entries ran.
    pub fn run_deferred(&self, env: &Arc<dyn CommandEnvironment>, cvars: &CvarStore) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
                deferred.pop_front()
            };
            let Some(item) = next else {
                return ran;
            };
            let text = if item.parse_cvars {
                expand_cvars(&item.text, cvars)
            } else {
                item.text
            };
            if let Err(e) = self.execute(&text, env) {
                log::warn!("Deferred command {:?} failed: {}", text, e);
                env.print(&e.to_string());
            }
            ran += 1;
        }
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Split on `;` and newlines that are outside double quotes.
pub fn split_commands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ';' | '\n' if !quoted => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Whitespace tokenizer with double quotes and `//` line comments.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };
        if first == '/' {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'/') {
                break;
            }
        }
        let mut token = String::new();
        if first == '"' {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                token.push(c);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        args.push(token);
    }
    args
}

/// Replace `$name$` with the current value of cvar `name`. Unknown cvars
/// expand to the empty string and `$$` yields a literal `$`.
pub fn expand_cvars(text: &str, cvars: &CvarStore) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('$') {
            Some(0) => {
                out.push('$');
                rest = &after[1..];
            }
            Some(end) => {
                out.push_str(&cvars.get(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Environment that prints to stdout and defers to a registry.
pub struct ConsoleEnvironment {
    registry: Arc<CommandRegistry>,
}

impl ConsoleEnvironment {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self { registry }
    }
}

impl CommandEnvironment for ConsoleEnvironment {
    fn print(&self, text: &str) {
        println!("{}", text);
    }

    fn execute_after(&self, command: &str, parse_cvars: bool) {
        self.registry.defer(command, parse_cvars);
    }
}

/// Environment that records printed lines. Deferred commands go to the
/// registry like the console environment.
pub struct BufferedEnvironment {
    registry: Arc<CommandRegistry>,
    lines: Mutex<Vec<String>>,
}

impl BufferedEnvironment {
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self {
            registry,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take_lines(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl CommandEnvironment for BufferedEnvironment {
    fn print(&self, text: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }

    fn execute_after(&self, command: &str, parse_cvars: bool) {
        self.registry.defer(command, parse_cvars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cvar::{CvarFlags, CvarSpec};

    fn setup() -> (Arc<CommandRegistry>, Arc<BufferedEnvironment>, Arc<dyn CommandEnvironment>) {
        let registry = Arc::new(CommandRegistry::new());
        let buffered = Arc::new(BufferedEnvironment::new(registry.clone()));
        let env: Arc<dyn CommandEnvironment> = buffered.clone();
        (registry, buffered, env)
    }

    fn echo() -> Arc<dyn Command> {
        Arc::new(|args: &[String], env: &Arc<dyn CommandEnvironment>| {
            env.print(&args[1..].join(" "));
            Ok(())
        })
    }

    #[test]
    fn test_tokenize_quotes_and_comments() {
        assert_eq!(tokenize("say  \"hello world\" x"), vec!["say", "hello world", "x"]);
        assert_eq!(tokenize("echo a // trailing"), vec!["echo", "a"]);
        assert_eq!(tokenize("a/b"), vec!["a/b"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_split_commands_respects_quotes() {
        assert_eq!(
            split_commands("echo a; echo \"b;c\"\necho d"),
            vec!["echo a", "echo \"b;c\"", "echo d"]
        );
    }

    #[test]
    fn test_execute_and_unknown() {
        let (registry, buffered, env) = setup();
        registry.add("echo", "print args", None, echo()).unwrap();
        registry.execute("ECHO hi there", &env).unwrap();
        assert_eq!(buffered.lines(), vec!["hi there"]);

        let err = registry.execute("nope", &env).unwrap_err();
        assert!(matches!(err, VmError::UnknownCommand(name) if name == "nope"));
    }

    #[test]
    fn test_duplicate_add_rejected() {
        let (registry, _, _) = setup();
        registry.add("echo", "", None, echo()).unwrap();
        assert!(registry.add("Echo", "", None, echo()).is_err());
        assert!(registry.add("bad name", "", None, echo()).is_err());
    }

    #[test]
    fn test_remove_owned_only_touches_owner() {
        let (registry, _, _) = setup();
        registry.add("a", "", Some("cgame"), echo()).unwrap();
        registry.add("b", "", Some("cgame"), echo()).unwrap();
        registry.add("c", "", Some("sgame"), echo()).unwrap();
        assert_eq!(registry.remove_owned("cgame"), 2);
        assert!(!registry.contains("a"));
        assert!(registry.contains("c"));
        assert_eq!(registry.list(), vec![("c".to_string(), String::new())]);
    }

    #[test]
    fn test_deferred_runs_in_order_with_cvar_expansion() {
        let (registry, buffered, env) = setup();
        let cvars = CvarStore::new();
        cvars
            .register("name", CvarSpec::new("", CvarFlags::empty(), "world"), None, None)
            .unwrap();
        registry.add("echo", "", None, echo()).unwrap();

        env.execute_after("echo first", false);
        env.execute_after("echo hello $name$", true);
        env.execute_after("missing", false);
        assert_eq!(registry.pending_deferred(), 3);

        assert_eq!(registry.run_deferred(&env, &cvars), 3);
        assert_eq!(
            buffered.lines(),
            vec!["first", "hello world", "Unknown command: missing"]
        );
    }

    #[test]
    fn test_expand_cvars_literals() {
        let cvars = CvarStore::new();
        assert_eq!(expand_cvars("cost $$5", &cvars), "cost $5");
        assert_eq!(expand_cvars("x $unknown$ y", &cvars), "x  y");
        assert_eq!(expand_cvars("dangling $x", &cvars), "dangling $x");
    }
}
