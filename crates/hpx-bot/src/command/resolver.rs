use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{
    args::{self, ArgValue, Args},
    cooldown::CooldownTable,
    handler::{CommandContext, CommandHandler},
    schema::{ArgSchema, ArgSpec, ArgType},
};
use crate::{
    collaborators::UserFetch,
    context::ClientContext,
    envelope::{ChatMessage, Envelope},
    error::CommandError,
};

/// A command ready to be registered.
pub struct CommandDefinition {
    name: String,
    schema: ArgSchema,
    handler: Arc<dyn CommandHandler>,
    description: Option<String>,
    cooldown: Option<Duration>,
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>, handler: impl CommandHandler) -> Self {
        Self {
            name: name.into(),
            schema: ArgSchema::new(),
            handler: Arc::new(handler),
            description: None,
            cooldown: None,
        }
    }

    #[must_use]
    pub fn schema(mut self, schema: ArgSchema) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Start a per-user cooldown after every successful invocation.
    #[must_use]
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }
}

/// A registered command.
pub struct CommandEntry {
    pub name: String,
    pub schema: ArgSchema,
    pub description: Option<String>,
    pub cooldown: Option<Duration>,
    handler: Arc<dyn CommandHandler>,
}

/// Listing entry returned by [`CommandResolver::command_info`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: String,
    pub description: Option<String>,
    pub aliases: Vec<String>,
}

/// Resolves prefixed message text to a command, parses its arguments and
/// runs the bound handler.
pub struct CommandResolver {
    commands: RwLock<BTreeMap<String, Arc<CommandEntry>>>,
    aliases: RwLock<HashMap<String, String>>,
    cooldowns: CooldownTable,
    context: Arc<ClientContext>,
}

impl CommandResolver {
    pub fn new(context: Arc<ClientContext>) -> Self {
        Self {
            commands: RwLock::new(BTreeMap::new()),
            aliases: RwLock::new(HashMap::new()),
            cooldowns: CooldownTable::default(),
            context,
        }
    }

    /// Register `handler` under `name` with an argument schema.
    pub fn register_command(
        &self,
        name: &str,
        schema: ArgSchema,
        handler: impl CommandHandler,
    ) -> Result<(), CommandError> {
        self.register(CommandDefinition::new(name, handler).schema(schema))
    }

    /// Register a fully described command.
    ///
    /// Fails if the name is empty, contains whitespace or is taken. A
    /// failed registration leaves the existing one untouched.
    pub fn register(&self, definition: CommandDefinition) -> Result<(), CommandError> {
        validate_name(&definition.name)?;
        let mut commands = self.commands.write();
        if commands.contains_key(&definition.name) {
            return Err(CommandError::DuplicateCommand {
                name: definition.name,
            });
        }
        debug!(command = %definition.name, args = definition.schema.len(), "Registered command");
        commands.insert(
            definition.name.clone(),
            Arc::new(CommandEntry {
                name: definition.name,
                schema: definition.schema,
                description: definition.description,
                cooldown: definition.cooldown,
                handler: definition.handler,
            }),
        );
        Ok(())
    }

    /// Remove a command and every alias pointing at it.
    pub fn remove_command(&self, name: &str) -> bool {
        let removed = self.commands.write().remove(name).is_some();
        if removed {
            self.aliases.write().retain(|_, target| target.as_str() != name);
            self.cooldowns.clear_command(name);
        }
        removed
    }

    /// Make `alias` resolve to `command`.
    pub fn add_alias(&self, alias: &str, command: &str) -> Result<(), CommandError> {
        validate_name(alias)?;
        if !self.commands.read().contains_key(command) {
            return Err(CommandError::UnknownAliasTarget {
                alias: alias.to_string(),
                command: command.to_string(),
            });
        }
        self.aliases
            .write()
            .insert(alias.to_string(), command.to_string());
        Ok(())
    }

    pub fn remove_alias(&self, alias: &str) -> bool {
        self.aliases.write().remove(alias).is_some()
    }

    /// Registered command names, sorted.
    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().keys().cloned().collect()
    }

    /// Commands with their descriptions and aliases, sorted by name.
    pub fn command_info(&self) -> Vec<CommandInfo> {
        let aliases = self.aliases.read();
        self.commands
            .read()
            .values()
            .map(|entry| {
                let mut names: Vec<String> = aliases
                    .iter()
                    .filter(|(_, target)| **target == entry.name)
                    .map(|(alias, _)| alias.clone())
                    .collect();
                names.sort();
                CommandInfo {
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    aliases: names,
                }
            })
            .collect()
    }

    /// Resolve a token through the aliases first, then the command table.
    pub fn resolve_name(&self, token: &str) -> Option<String> {
        if let Some(target) = self.aliases.read().get(token) {
            return Some(target.clone());
        }
        self.commands
            .read()
            .contains_key(token)
            .then(|| token.to_string())
    }

    pub fn set_cooldown(&self, command: &str, user_id: i64, duration: Duration) {
        self.cooldowns.set(command, user_id, duration);
    }

    /// Remaining cooldown for `user_id` on `command`, or zero.
    pub fn check_cooldown(&self, command: &str, user_id: i64) -> Duration {
        self.cooldowns.check(command, user_id)
    }

    /// Resolve `body` (message text without the prefix) and parse its
    /// arguments for `message`.
    pub async fn parse(
        &self,
        body: &str,
        message: &ChatMessage,
    ) -> Result<(Arc<CommandEntry>, Args), CommandError> {
        let body = body.trim();
        let (token, tail) = body
            .split_once(char::is_whitespace)
            .unwrap_or((body, ""));

        let entry = self
            .resolve_name(token)
            .and_then(|name| self.commands.read().get(&name).cloned())
            .ok_or_else(|| CommandError::CommandNotFound {
                name: token.to_string(),
                text: body.to_string(),
            })?;

        let remaining = self.check_cooldown(&entry.name, message.user_id());
        if !remaining.is_zero() {
            return Err(CommandError::CommandOnCooldown {
                command: entry.name.clone(),
                remaining,
            });
        }

        let mut tokens: VecDeque<&str> = tail.split_whitespace().collect();
        let mut parsed = Args::new();
        for (name, spec) in entry.schema.iter() {
            if let Some(value) = self.parse_arg(name, spec, &mut tokens, message).await? {
                parsed.insert(name, value);
            }
        }
        Ok((entry, parsed))
    }

    async fn parse_arg(
        &self,
        name: &str,
        spec: &ArgSpec,
        tokens: &mut VecDeque<&str>,
        message: &ChatMessage,
    ) -> Result<Option<ArgValue>, CommandError> {
        let token = if spec.rest {
            let joined = tokens.drain(..).collect::<Vec<_>>().join(" ");
            (!joined.is_empty()).then_some(joined)
        } else {
            tokens.pop_front().map(str::to_owned)
        };

        let Some(token) = token else {
            if spec.required {
                return Err(CommandError::MissingArgument {
                    name: name.to_string(),
                });
            }
            return match (&spec.default, spec.kind) {
                (Some(ArgValue::String(tag)), ArgType::User) => Ok(Some(
                    args::lookup_user(name, tag, self.user_fetch()).await?,
                )),
                (default, _) => Ok(default.clone()),
            };
        };

        let value = match spec.kind {
            ArgType::String => ArgValue::String(token),
            ArgType::Int => args::parse_int(name, &token)?,
            ArgType::Float => args::parse_float(name, &token)?,
            ArgType::Boolean => args::parse_bool(name, &token)?,
            ArgType::User => args::lookup_user(name, &token, self.user_fetch()).await?,
            // The token only holds the slot; the value is the message's repost.
            ArgType::Repost => args::repost_of(name, message)?,
        };
        Ok(Some(value))
    }

    fn user_fetch(&self) -> Option<&dyn UserFetch> {
        self.context.user_fetch().ok().map(|users| &**users)
    }

    /// Parse `body` and run the bound handler.
    ///
    /// Returns the resolved command name. The handler never runs when
    /// resolution or parsing fails.
    pub async fn dispatch(
        &self,
        body: &str,
        message: Arc<ChatMessage>,
        envelope: Arc<Envelope>,
    ) -> Result<String, CommandError> {
        let (entry, parsed) = self.parse(body, &message).await?;
        let user_id = message.user_id();
        let ctx = CommandContext::new(
            entry.name.clone(),
            message,
            envelope,
            Arc::clone(&self.context),
        );

        debug!(command = %entry.name, user_id, "Invoking command");
        entry
            .handler
            .call(ctx, parsed)
            .await
            .map_err(|source| {
                warn!(command = %entry.name, error = %source, "Command handler failed");
                CommandError::Handler {
                    command: entry.name.clone(),
                    source,
                }
            })?;

        if let Some(cooldown) = entry.cooldown {
            self.cooldowns.set(&entry.name, user_id, cooldown);
        }
        Ok(entry.name.clone())
    }
}

fn validate_name(name: &str) -> Result<(), CommandError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(CommandError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        collaborators::UserDirectory,
        envelope::User,
        error::BoxError,
    };

    type Calls = Arc<Mutex<Vec<Args>>>;

    fn recording(calls: &Calls) -> impl CommandHandler {
        let calls = Arc::clone(calls);
        move |_ctx: CommandContext, args: Args| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().push(args);
                Ok::<(), BoxError>(())
            }
        }
    }

    fn resolver() -> CommandResolver {
        let users = UserDirectory::from_users([User {
            id: 3,
            tag: "bob".to_string(),
            name: Some("Bob".to_string()),
        }]);
        CommandResolver::new(Arc::new(
            ClientContext::new().with_user_fetch(Arc::new(users)),
        ))
    }

    fn message(text: &str) -> Arc<ChatMessage> {
        Arc::new(ChatMessage {
            id: 1,
            dialog_id: 2,
            text: text.to_string(),
            sender: User {
                id: 7,
                tag: "alice".to_string(),
                name: None,
            },
            repost: None,
        })
    }

    fn envelope() -> Arc<Envelope> {
        Arc::new(Envelope::new("message", Value::Null))
    }

    #[tokio::test]
    async fn test_parses_typed_arguments() {
        let resolver = resolver();
        let calls = Calls::default();
        let schema = ArgSchema::from_json(r#"{"name": "string", "age": "int"}"#).expect("schema");
        resolver
            .register_command("greet", schema, recording(&calls))
            .expect("register");

        let name = resolver
            .dispatch("greet Alice 30", message("/greet Alice 30"), envelope())
            .await
            .expect("dispatch");

        assert_eq!(name, "greet");
        let calls = calls.lock();
        assert_eq!(calls[0].str("name"), Some("Alice"));
        assert_eq!(calls[0].int("age"), Some(30));
    }

    #[tokio::test]
    async fn test_invalid_integer_skips_handler() {
        let resolver = resolver();
        let calls = Calls::default();
        let schema = ArgSchema::from_json(r#"{"name": "string", "age": "int"}"#).expect("schema");
        resolver
            .register_command("greet", schema, recording(&calls))
            .expect("register");

        let err = resolver
            .dispatch("greet Alice notanumber", message(""), envelope())
            .await
            .expect_err("bad int");

        assert!(matches!(
            err,
            CommandError::InvalidInteger { ref name, ref value } if name == "age" && value == "notanumber"
        ));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rest_argument_captures_tail() {
        let resolver = resolver();
        let calls = Calls::default();
        let schema = ArgSchema::from_json(r#"{"text": ["string", null, "rest"]}"#).expect("schema");
        resolver
            .register_command("say", schema, recording(&calls))
            .expect("register");

        resolver
            .dispatch("say hello   there world", message(""), envelope())
            .await
            .expect("dispatch");

        assert_eq!(calls.lock()[0].str("text"), Some("hello there world"));
    }

    #[tokio::test]
    async fn test_missing_and_default_arguments() {
        let resolver = resolver();
        let calls = Calls::default();
        let schema = ArgSchema::new()
            .arg("count", ArgSpec::new(ArgType::Int).with_default(1_i64))
            .arg("loud", ArgSpec::new(ArgType::Boolean).optional());
        resolver
            .register_command("roll", schema, recording(&calls))
            .expect("register");
        resolver
            .register_command(
                "need",
                ArgSchema::new().arg("x", ArgSpec::new(ArgType::Float)),
                recording(&calls),
            )
            .expect("register");

        resolver
            .dispatch("roll", message(""), envelope())
            .await
            .expect("defaults");
        {
            let calls = calls.lock();
            assert_eq!(calls[0].int("count"), Some(1));
            assert!(!calls[0].contains("loud"));
        }

        let err = resolver
            .dispatch("need", message(""), envelope())
            .await
            .expect_err("missing");
        assert!(matches!(err, CommandError::MissingArgument { ref name } if name == "x"));
    }

    #[tokio::test]
    async fn test_user_argument_lookup() {
        let resolver = resolver();
        let calls = Calls::default();
        let schema = ArgSchema::new()
            .arg("target", ArgSpec::new(ArgType::User))
            .arg("backup", ArgSpec::new(ArgType::User).with_default("bob"));
        resolver
            .register_command("poke", schema, recording(&calls))
            .expect("register");

        resolver
            .dispatch("poke @bob", message(""), envelope())
            .await
            .expect("dispatch");
        {
            let calls = calls.lock();
            assert_eq!(calls[0].user("target").map(|u| u.id), Some(3));
            assert_eq!(calls[0].user("backup").map(|u| u.id), Some(3));
        }

        let err = resolver
            .dispatch("poke @nobody", message(""), envelope())
            .await
            .expect_err("unknown user");
        assert!(matches!(err, CommandError::UserNotFound { ref tag, .. } if tag == "nobody"));
    }

    #[tokio::test]
    async fn test_repost_argument() {
        let resolver = resolver();
        let calls = Calls::default();
        resolver
            .register_command(
                "quote",
                ArgSchema::new()
                    .arg("original", ArgSpec::new(ArgType::Repost))
                    .arg("note", ArgSpec::new(ArgType::String).rest().optional()),
                recording(&calls),
            )
            .expect("register");

        let err = resolver
            .dispatch("quote nice", message(""), envelope())
            .await
            .expect_err("no repost");
        assert!(matches!(err, CommandError::MissingRepost { .. }));

        let mut with_repost = (*message("")).clone();
        with_repost.repost = Some(json!({ "Id": 99 }));
        resolver
            .dispatch("quote ^ nice one", Arc::new(with_repost.clone()), envelope())
            .await
            .expect("dispatch");
        {
            let calls = calls.lock();
            assert_eq!(calls[0].repost("original"), Some(&json!({ "Id": 99 })));
            assert_eq!(calls[0].str("note"), Some("nice one"));
        }

        let err = resolver
            .dispatch("quote", Arc::new(with_repost), envelope())
            .await
            .expect_err("no token for the repost slot");
        assert!(matches!(err, CommandError::MissingArgument { ref name } if name == "original"));
    }

    #[tokio::test]
    async fn test_repost_slot_consumes_a_token() {
        let resolver = resolver();
        let calls = Calls::default();
        resolver
            .register_command(
                "q",
                ArgSchema::from_json(r#"{"orig": "repost", "note": "string"}"#).expect("schema"),
                recording(&calls),
            )
            .expect("register");

        let mut with_repost = (*message("")).clone();
        with_repost.repost = Some(json!({ "Id": 5 }));
        resolver
            .dispatch("q first second", Arc::new(with_repost), envelope())
            .await
            .expect("dispatch");

        let calls = calls.lock();
        assert_eq!(calls[0].repost("orig"), Some(&json!({ "Id": 5 })));
        assert_eq!(calls[0].str("note"), Some("second"));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let resolver = resolver();
        let err = resolver
            .dispatch("nope a b", message("/nope a b"), envelope())
            .await
            .expect_err("unknown");
        assert!(matches!(
            err,
            CommandError::CommandNotFound { ref name, ref text } if name == "nope" && text == "nope a b"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let resolver = resolver();
        let first = Calls::default();
        let second = Calls::default();
        resolver
            .register(CommandDefinition::new("ping", recording(&first)).description("first"))
            .expect("register");

        let err = resolver
            .register(CommandDefinition::new("ping", recording(&second)).description("second"))
            .expect_err("duplicate");
        assert!(matches!(err, CommandError::DuplicateCommand { .. }));

        resolver
            .dispatch("ping", message(""), envelope())
            .await
            .expect("dispatch");
        assert_eq!(first.lock().len(), 1);
        assert!(second.lock().is_empty());
        assert_eq!(
            resolver.command_info()[0].description.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_invalid_names_rejected() {
        let resolver = resolver();
        let calls = Calls::default();
        for name in ["", "two words", " "] {
            assert!(matches!(
                resolver.register_command(name, ArgSchema::new(), recording(&calls)),
                Err(CommandError::InvalidName { .. })
            ));
        }
        assert!(resolver.get_commands().is_empty());
    }

    #[tokio::test]
    async fn test_alias_resolution_and_cascade() {
        let resolver = resolver();
        let calls = Calls::default();
        resolver
            .register_command("ping", ArgSchema::new(), recording(&calls))
            .expect("register");
        resolver
            .register_command("echo", ArgSchema::new(), recording(&calls))
            .expect("register");
        resolver.add_alias("p", "ping").expect("alias");
        resolver.add_alias("pp", "ping").expect("alias");
        resolver.add_alias("e", "echo").expect("alias");

        assert!(matches!(
            resolver.add_alias("x", "missing"),
            Err(CommandError::UnknownAliasTarget { .. })
        ));

        let name = resolver
            .dispatch("p", message(""), envelope())
            .await
            .expect("alias dispatch");
        assert_eq!(name, "ping");
        assert_eq!(
            resolver.command_info()[1].aliases,
            vec!["p".to_string(), "pp".to_string()]
        );

        assert!(resolver.remove_command("ping"));
        assert_eq!(resolver.resolve_name("p"), None);
        assert_eq!(resolver.resolve_name("pp"), None);
        assert_eq!(resolver.resolve_name("e").as_deref(), Some("echo"));
        assert_eq!(resolver.get_commands(), vec!["echo".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_until_expiry() {
        let resolver = resolver();
        let calls = Calls::default();
        resolver
            .register_command("ping", ArgSchema::new(), recording(&calls))
            .expect("register");
        resolver.set_cooldown("ping", 7, Duration::from_millis(5000));

        let remaining = resolver.check_cooldown("ping", 7);
        assert!(remaining > Duration::ZERO && remaining <= Duration::from_millis(5000));

        let err = resolver
            .dispatch("ping", message(""), envelope())
            .await
            .expect_err("cooldown");
        assert!(err.remaining_ms().is_some_and(|ms| ms > 0 && ms <= 5000));
        assert!(calls.lock().is_empty());

        tokio::time::advance(Duration::from_millis(5001)).await;
        assert_eq!(resolver.check_cooldown("ping", 7), Duration::ZERO);
        assert_eq!(resolver.cooldowns.len(), 0);
        resolver
            .dispatch("ping", message(""), envelope())
            .await
            .expect("after cooldown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_cooldown_after_success() {
        let resolver = resolver();
        let calls = Calls::default();
        resolver
            .register(
                CommandDefinition::new("roll", recording(&calls))
                    .cooldown(Duration::from_secs(3)),
            )
            .expect("register");

        resolver
            .dispatch("roll", message(""), envelope())
            .await
            .expect("first");
        assert!(matches!(
            resolver.dispatch("roll", message(""), envelope()).await,
            Err(CommandError::CommandOnCooldown { .. })
        ));
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let resolver = resolver();
        resolver
            .register_command(
                "fail",
                ArgSchema::new(),
                |_ctx: CommandContext, _args: Args| async move {
                    Err::<(), BoxError>("handler exploded".into())
                },
            )
            .expect("register");

        let err = resolver
            .dispatch("fail", message(""), envelope())
            .await
            .expect_err("handler error");
        assert!(matches!(err, CommandError::Handler { ref command, .. } if command == "fail"));
    }
}
