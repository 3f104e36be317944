use clap::{Args, Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{error, info, warn};

mod compose;
mod config;
mod deps;
mod diagnostics;
mod environment;
mod error;
mod gateway;
mod pipeline;
mod ports;
mod schema;
mod settings;
mod sources;
mod validate;

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "stack-bootstrap")]
#[command(about = "Resolve stack configuration: selectors, dependencies, ports, environment and gateway routes", long_about = None)]
struct Cli {
    /// Repository root holding the schema, settings and volumes.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Settings file (default: $GENAI_ENV_FILE, then <root>/.env).
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Service schema (default: <root>/bootstrapper/service-configs.yml).
    #[arg(long, global = true)]
    schema: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Args, Clone, Default)]
struct SourceOverrides {
    /// Run-scoped selector override, e.g. --source WEAVIATE_SOURCE=disabled.
    #[arg(long = "source", value_name = "VAR=VALUE")]
    sources: Vec<String>,
}

impl SourceOverrides {
    fn parse(&self) -> Result<sources::SourceMap> {
        let mut out = sources::SourceMap::new();
        for arg in &self.sources {
            let (key, value) = sources::parse_override(arg)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline and write settings plus gateway routes.
    Resolve {
        #[arg(long)]
        base_port: Option<u32>,

        #[command(flatten)]
        overrides: SourceOverrides,

        /// Write --source overrides into the settings file.
        #[arg(long)]
        persist_overrides: bool,

        #[arg(long)]
        no_backup: bool,

        /// Recreate the settings file from the template first.
        #[arg(long)]
        cold: bool,
    },

    /// Check selectors and scales without changing anything.
    Validate {
        #[command(flatten)]
        overrides: SourceOverrides,
    },

    /// Report dependency violations; --fix disables the dependents.
    Deps {
        #[arg(long)]
        fix: bool,
    },

    #[command(subcommand)]
    Ports(PortsCmd),

    /// Print the computed environment.
    Env {
        #[arg(long)]
        json: bool,

        /// Also write it to the settings file.
        #[arg(long)]
        write: bool,
    },

    /// Regenerate the gateway routing document.
    Gateway {
        #[arg(short = 'o', long)]
        out: Option<PathBuf>,
    },

    /// Run docker compose with the project name and settings file.
    Compose {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        verbs: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PortsCmd {
    /// Validate a base port and list ports already in use.
    Check { base: u32 },

    /// Find a base port whose whole range is free.
    Suggest {
        #[arg(long, default_value_t = ports::SUGGEST_START)]
        start: u16,

        #[arg(long, default_value_t = ports::SUGGEST_ATTEMPTS)]
        attempts: u32,

        #[arg(long, default_value_t = ports::SUGGEST_STEP)]
        step: u16,
    },

    /// Write every port variable for a base port.
    Apply {
        base: u32,

        #[arg(long)]
        no_backup: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    diagnostics::init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{:#}", err);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let paths = config::Paths::from_process(&cli.root, cli.env_file.as_deref(), cli.schema.as_deref());

    match cli.cmd {
        Commands::Resolve {
            base_port,
            overrides,
            persist_overrides,
            no_backup,
            cold,
        } => {
            let opts = pipeline::ResolveOptions {
                base_port,
                overrides: overrides.parse()?,
                override_mode: if persist_overrides {
                    sources::OverrideMode::Persistent
                } else {
                    sources::OverrideMode::Ephemeral
                },
                backup: !no_backup,
                cold,
            };
            let loopback = environment::system_loopback_host();
            let outcome = pipeline::run_resolve(
                &paths,
                &opts,
                &ports::PortAllocator::tcp(),
                &gateway::GatewayGenerator::with_tcp_probe(loopback.as_str()),
                &loopback,
            )?;
            for service in &outcome.resolution.disabled {
                warn!("{} was disabled to satisfy its dependencies", service);
            }
            println!(
                "Resolved {} selector(s), base port {}, {} port(s), {} computed variable(s)",
                outcome.sources.len(),
                outcome.base_port,
                outcome.ports.len(),
                outcome.environment.len()
            );
        }

        Commands::Validate { overrides } => {
            let mut loaded = pipeline::load(&paths)?;
            sources::apply_overrides(&mut loaded.settings, &overrides.parse()?);
            let selected = sources::resolve_all(&loaded.settings);
            let validator = validate::Validator::new(&loaded.schema);
            if let Err(err) = validator.validate(&loaded.settings, &selected) {
                if let error::Error::Validation(violations) = &err {
                    for v in violations {
                        error!("{}", v);
                    }
                }
                return Err(err.into());
            }
            println!("{} selector(s) valid", selected.len());
        }

        Commands::Deps { fix } => {
            let loaded = pipeline::load(&paths)?;
            let resolver = deps::DependencyResolver::new(&loaded.schema);
            let mut view = resolver.working_view(&loaded.settings);
            if !fix {
                let violations = resolver.check(&view);
                for v in &violations {
                    warn!("{} -> {}: {}", v.service, v.required, v.message);
                }
                for note in resolver.optional_info(&view) {
                    info!("{}", note);
                }
                println!("{} dependency violation(s)", violations.len());
                return Ok(if violations.is_empty() { 0 } else { 1 });
            }
            let resolution = resolver.resolve(&mut view);
            if !resolution.patch.is_empty() {
                use settings::SettingsStore;
                loaded.store.upsert_many(&resolution.patch, true)?;
            }
            println!("disabled: {}", resolution.disabled.join(", "));
        }

        Commands::Ports(cmd) => return run_ports(&paths, cmd),

        Commands::Env { json, write } => {
            let loaded = pipeline::load(&paths)?;
            let selected = sources::resolve_all(&loaded.settings);
            let resolver = deps::DependencyResolver::new(&loaded.schema);
            let mut view = resolver.working_view(&loaded.settings);
            let resolution = resolver.resolve(&mut view);
            let loopback = environment::system_loopback_host();
            let env = environment::EnvironmentSynthesizer::new(&loaded.schema, loopback)
                .synthesize(&loaded.settings, &selected, &resolution.patch);
            if json {
                println!("{}", serde_json::to_string_pretty(&env)?);
            } else {
                print!("{}", settings::serialize_settings(&env));
            }
            if write {
                environment::persist(&loaded.store, &env, true)?;
            }
        }

        Commands::Gateway { out } => {
            let loaded = pipeline::load(&paths)?;
            let selected = sources::resolve_all(&loaded.settings);
            let resolver = deps::DependencyResolver::new(&loaded.schema);
            let mut view = resolver.working_view(&loaded.settings);
            let disabled: BTreeSet<String> = resolver.resolve(&mut view).disabled.into_iter().collect();
            let generated = gateway::GatewayGenerator::with_tcp_probe(environment::system_loopback_host())
                .generate(&selected, &loaded.settings, &disabled);
            let problems = gateway::validate(&generated.document);
            if !problems.is_empty() {
                anyhow::bail!(diagnostics::error_message(problems.join("; ")));
            }
            let out = out.unwrap_or_else(|| paths.gateway.clone());
            gateway::write(&generated.document, &out)?;
            println!(
                "Wrote {} ({} service(s), {} skipped)",
                out.display(),
                generated.document.services.len(),
                generated.errors.len()
            );
        }

        Commands::Compose { verbs } => {
            let store = paths.store();
            let project = store.project_name()?;
            let compose = compose::Compose::new(
                compose::Program::detect()?,
                &project,
                &paths.root,
                store.path(),
            );
            if verbs.first().map(String::as_str) == Some("port") && verbs.len() == 3 {
                return match compose.port(&verbs[1], &verbs[2])? {
                    Some(port) => {
                        println!("{}", port);
                        Ok(0)
                    }
                    None => Ok(1),
                };
            }
            return compose.run(&verbs);
        }
    }

    Ok(0)
}

fn run_ports(paths: &config::Paths, cmd: PortsCmd) -> Result<i32> {
    let allocator = ports::PortAllocator::tcp();
    match cmd {
        PortsCmd::Check { base } => {
            let base = ports::validate_base(base)?;
            let conflicts = allocator.conflicts(base);
            for (var, port) in &conflicts {
                warn!("{} = {} is in use", var, port);
            }
            println!("{} conflict(s) for base {}", conflicts.len(), base);
            Ok(if conflicts.is_empty() { 0 } else { 1 })
        }
        PortsCmd::Suggest {
            start,
            attempts,
            step,
        } => match allocator.suggest(start, attempts, step) {
            Some(base) => {
                println!("{}", base);
                Ok(0)
            }
            None => Ok(1),
        },
        PortsCmd::Apply { base, no_backup } => {
            let base = allocator.check(base)?;
            let store = paths.store();
            ports::update_env_ports(&store, base, !no_backup)?;
            for (var, value) in ports::assignment_report(&store)? {
                println!("{}={}", var, value.unwrap_or_default());
            }
            Ok(0)
        }
    }
}
