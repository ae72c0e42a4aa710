//! Command-line front end: inspect templates, preview bindings and run DAO
//! methods against a SQLite database.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use sqldao::{
    compile, logging, BindingContext, Dao, DaoConfig, DaoErrorWithCode, MethodKind,
    SqliteExecutor, Value,
};

#[derive(Parser, Debug)]
#[command(
    name = "sqldao",
    version,
    about = "Compile, bind and run declarative SQL templates",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "SQLDAO_LOG",
        default_value = "warn",
        help = "Tracing filter directive"
    )]
    log: String,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the token sequence of a template
    Compile {
        #[arg(value_name = "SQL")]
        sql: String,
    },
    /// Bind a configured method without executing it
    Bind(CallArgs),
    /// Execute a configured method against a SQLite database
    Run {
        #[command(flatten)]
        call: CallArgs,

        #[arg(long, value_name = "DB", help = "SQLite database file")]
        db: PathBuf,

        #[arg(long, value_name = "FILE", help = "SQL script executed before the call")]
        init: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct CallArgs {
    #[arg(long, value_name = "FILE", help = "DAO configuration (TOML)")]
    config: PathBuf,

    #[arg(long, help = "Method name")]
    method: String,

    #[arg(long, value_name = "JSON", help = "Arguments as a JSON object")]
    args: Option<String>,

    #[arg(
        long = "define",
        value_name = "NAME=FRAGMENT",
        help = "Template variable fragment (repeatable)"
    )]
    defines: Vec<String>,
}

impl CallArgs {
    fn context(&self) -> Result<BindingContext, Box<dyn Error>> {
        let mut ctx = match &self.args {
            Some(raw) => {
                let json: serde_json::Value = serde_json::from_str(raw)?;
                BindingContext::from_entity(&Value::from(json))?
            }
            None => BindingContext::new(),
        };
        for define in &self.defines {
            let (name, fragment) = define
                .split_once('=')
                .ok_or_else(|| format!("--define expects NAME=FRAGMENT, got '{define}'"))?;
            ctx.set_define(name.trim(), fragment);
        }
        Ok(ctx)
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = logging::init_logging(&cli.log) {
        eprintln!("warning: {err}");
    }
    if let Err(err) = run(cli) {
        match err.downcast_ref::<sqldao::DaoError>() {
            Some(dao_err) => eprintln!("error: {}", DaoErrorWithCode(dao_err)),
            None => eprintln!("error: {err}"),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Compile { sql } => {
            let template = compile(&sql)?;
            match cli.format {
                OutputFormat::Text => print!("{template}"),
                OutputFormat::Json => {
                    let params: Vec<String> = template
                        .named_params()
                        .map(|p| {
                            if p.path.is_empty() {
                                p.name.clone()
                            } else {
                                format!("{}.{}", p.name, p.dotted_path())
                            }
                        })
                        .collect();
                    let defines: Vec<&str> =
                        template.template_vars().map(|v| v.name.as_str()).collect();
                    let out = json!({
                        "tokens": template.tokens().len(),
                        "params": params,
                        "defines": defines,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Command::Bind(call) => {
            let config = DaoConfig::load(&call.config)?;
            let dao = Dao::new(config, Arc::new(SqliteExecutor::open_in_memory()?))?;
            let plan = dao.plan(&call.method, &call.context()?)?;
            match cli.format {
                OutputFormat::Text => {
                    println!("{}", plan.sql());
                    for (idx, bound) in plan.bound_values().iter().enumerate() {
                        match bound.index {
                            Some(i) => {
                                println!("  ${} = {} ({}[{i}])", idx + 1, bound.value, bound.param)
                            }
                            None => println!("  ${} = {} ({})", idx + 1, bound.value, bound.param),
                        }
                    }
                }
                OutputFormat::Json => {
                    let values: Vec<serde_json::Value> =
                        plan.bound_values().iter().map(|b| b.value.to_json()).collect();
                    let out = json!({ "sql": plan.sql(), "values": values });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Command::Run { call, db, init } => {
            let config = DaoConfig::load(&call.config)?;
            let executor = SqliteExecutor::open(&db)?;
            if let Some(script) = init {
                executor.execute_script(&fs::read_to_string(script)?)?;
            }
            let dao = Dao::new(config, Arc::new(executor.clone()))?
                .with_transactions(Arc::new(executor.transactions()));
            let ctx = call.context()?;
            let kind = dao
                .method_spec(&call.method)
                .map(|spec| spec.kind)
                .ok_or_else(|| format!("unknown method '{}'", call.method))?;
            match kind {
                MethodKind::Read => {
                    let rows = dao.query(&call.method, &ctx)?;
                    let json: Vec<serde_json::Value> = rows.iter().map(Value::to_json).collect();
                    match cli.format {
                        OutputFormat::Text => {
                            for row in &json {
                                println!("{row}");
                            }
                        }
                        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&json)?),
                    }
                }
                MethodKind::Write => {
                    let affected = dao.update(&call.method, &ctx)?;
                    match cli.format {
                        OutputFormat::Text => println!("{affected} row(s) affected"),
                        OutputFormat::Json => println!("{}", json!({ "affected": affected })),
                    }
                }
            }
        }
    }
    Ok(())
}
