//! Command registration, resolution and typed argument parsing.
//!
//! Text after the prefix is split into a command token and argument tokens.
//! The token is resolved through aliases first, then the command table.
//! Arguments are then parsed left to right in schema declaration order:
//! a `rest` entry takes every remaining token, other entries take one.
//!
//! ```rust,ignore
//! use hpx_bot::command::{ArgSchema, CommandResolver};
//!
//! let schema = ArgSchema::from_json(r#"{"name": "string", "age": "int"}"#)?;
//! resolver.register_command("greet", schema, |ctx: CommandContext, args: Args| async move {
//!     let name = args.str("name").unwrap_or("stranger");
//!     ctx.reply(format!("Hello, {name}!")).await?;
//!     Ok(())
//! })?;
//! ```

mod args;
mod cooldown;
mod handler;
mod resolver;
mod schema;

pub use args::{ArgValue, Args};
pub use handler::{CommandContext, CommandHandler};
pub use resolver::{CommandDefinition, CommandEntry, CommandInfo, CommandResolver};
pub use schema::{ArgSchema, ArgSpec, ArgType};
