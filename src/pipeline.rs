//! One resolution run: source -> validate -> deps -> ports -> env -> gateway.

use crate::Result;
use crate::config::Paths;
use crate::deps::{DependencyResolver, Resolution};
use crate::environment::{ComputedEnvironment, EnvironmentSynthesizer, persist};
use crate::error::Error;
use crate::gateway::{self, GatewayGenerator};
use crate::ports::{self, DEFAULT_BASE_PORT, PortAllocator, PortProbe};
use crate::schema::ServiceSchema;
use crate::settings::{EnvFile, SettingsMap, SettingsStore};
use crate::sources::{self, OverrideMode, SourceMap};
use crate::validate::Validator;
use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Schema, store and a settings snapshot for one invocation.
pub struct Loaded {
    pub schema: ServiceSchema,
    pub store: EnvFile,
    pub settings: SettingsMap,
}

/// Load the schema first so a bad schema aborts before anything is touched.
pub fn load(paths: &Paths) -> Result<Loaded> {
    let schema = ServiceSchema::load(&paths.schema)?;
    let store = paths.store();
    if store.is_custom_location() {
        info!("using settings file {}", store.path().display());
    }
    let settings = store
        .read_all()
        .with_context(|| crate::diagnostics::error_message("cannot read settings"))?;
    Ok(Loaded {
        schema,
        store,
        settings,
    })
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Explicit base port; else `BASE_PORT` from the settings, else the default.
    pub base_port: Option<u32>,
    pub overrides: SourceMap,
    pub override_mode: OverrideMode,
    pub backup: bool,
    /// Recreate the settings file from the template before resolving.
    pub cold: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            base_port: None,
            overrides: SourceMap::new(),
            override_mode: OverrideMode::Ephemeral,
            backup: true,
            cold: false,
        }
    }
}

#[derive(Debug)]
pub struct Outcome {
    pub sources: SourceMap,
    pub resolution: Resolution,
    pub base_port: u16,
    pub ports: BTreeMap<String, u16>,
    pub environment: ComputedEnvironment,
    /// Entries left out of the routing table.
    pub gateway_errors: Vec<Error>,
}

/// Base port to use when none is passed on the command line.
pub fn configured_base_port(settings: &SettingsMap) -> u32 {
    settings
        .get("BASE_PORT")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(u32::from(DEFAULT_BASE_PORT))
}

pub fn run_resolve<P: PortProbe, Q: PortProbe>(
    paths: &Paths,
    opts: &ResolveOptions,
    allocator: &PortAllocator<P>,
    generator: &GatewayGenerator<Q>,
    loopback_host: &str,
) -> Result<Outcome> {
    let store = paths.store();
    if opts.cold || !store.exists() {
        store.init_from_template(&paths.template, opts.cold)?;
    }
    let Loaded {
        schema,
        store,
        mut settings,
    } = load(paths)?;

    // sources
    sources::apply_overrides(&mut settings, &opts.overrides);
    let sources = sources::resolve_all(&settings);
    debug!("{} selector(s) in effect", sources.len());

    // validate
    if let Err(err) = Validator::new(&schema).validate(&settings, &sources) {
        if let Error::Validation(violations) = &err {
            for v in violations {
                error!("{}", v);
            }
        }
        return Err(err.into());
    }

    // deps
    let resolver = DependencyResolver::new(&schema);
    let mut view = resolver.working_view(&settings);
    let resolution = resolver.resolve(&mut view);

    // ports
    let base = opts.base_port.unwrap_or_else(|| configured_base_port(&settings));
    let base_port = allocator.check(base)?;
    let ports = ports::compute(base_port);

    // env, one write with the ports folded in
    let synth = EnvironmentSynthesizer::new(&schema, loopback_host);
    let environment = synth.synthesize(&settings, &sources, &resolution.patch);
    let mut update = environment.clone();
    for (var, port) in &ports {
        update.insert(var.clone(), port.to_string());
    }
    update.insert("BASE_PORT".to_string(), base_port.to_string());
    if opts.override_mode == OverrideMode::Persistent {
        update.extend(opts.overrides.clone());
        info!("persisting {} source override(s)", opts.overrides.len());
    }
    persist(&store, &update, opts.backup)?;
    for (var, value) in ports::assignment_report(&store)? {
        debug!("{} = {}", var, value.as_deref().unwrap_or("<unset>"));
    }

    // gateway
    settings.extend(update);
    let disabled: BTreeSet<String> = resolution.disabled.iter().cloned().collect();
    let generated = generator.generate(&sources, &settings, &disabled);
    let problems = gateway::validate(&generated.document);
    if !problems.is_empty() {
        return Err(Error::GatewayWrite {
            path: paths.gateway.clone(),
            reason: problems.join("; "),
        }
        .into());
    }
    gateway::write(&generated.document, &paths.gateway)?;
    if !generated.errors.is_empty() {
        warn!(
            "{} gateway entr(y/ies) left out of {}",
            generated.errors.len(),
            paths.gateway.display()
        );
    }

    info!(
        "resolved {} service(s) on base port {}",
        sources.len(),
        base_port
    );
    Ok(Outcome {
        sources,
        resolution,
        base_port,
        ports,
        environment,
        gateway_errors: generated.errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::tests::SAMPLE_SCHEMA;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;

    struct Busy(BTreeSet<u16>);

    impl PortProbe for Busy {
        fn in_use(&self, port: u16) -> bool {
            self.0.contains(&port)
        }
    }

    fn free() -> Busy {
        Busy(BTreeSet::new())
    }

    fn stack(dir: &Path, env: &str) -> Paths {
        fs::create_dir_all(dir.join("bootstrapper")).expect("mkdir");
        fs::write(dir.join("bootstrapper/service-configs.yml"), SAMPLE_SCHEMA).expect("schema");
        fs::write(dir.join(".env.example"), "PROJECT_NAME=genai\nN8N_SOURCE=container\n")
            .expect("template");
        if !env.is_empty() {
            fs::write(dir.join(".env"), env).expect("env");
        }
        Paths::resolve(dir, None, None, None)
    }

    /// The bundled demo schema and template, with `env` as the settings file.
    fn demo_stack(dir: &Path, env: &str) -> Paths {
        fs::create_dir_all(dir.join("bootstrapper")).expect("mkdir");
        fs::write(
            dir.join("bootstrapper/service-configs.yml"),
            include_str!("../demos/bootstrapper/service-configs.yml"),
        )
        .expect("schema");
        fs::write(dir.join(".env.example"), include_str!("../demos/.env.example")).expect("template");
        fs::write(dir.join(".env"), env).expect("env");
        Paths::resolve(dir, None, None, None)
    }

    fn demo_settings(replace: &str, with: &str) -> String {
        include_str!("../demos/.env.example").replace(replace, with)
    }

    fn run(paths: &Paths, opts: &ResolveOptions, busy: Busy) -> Result<Outcome> {
        run_resolve(
            paths,
            opts,
            &PortAllocator::new(busy),
            &GatewayGenerator::new(free(), "host.docker.internal"),
            "host.docker.internal",
        )
    }

    #[test]
    fn full_run_disables_dependents_and_writes_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "N8N_SOURCE=container\nWEAVIATE_SOURCE=disabled\n");

        let outcome = run(&paths, &ResolveOptions::default(), free()).expect("resolve");
        assert_eq!(outcome.resolution.disabled, vec!["n8n".to_string()]);
        assert_eq!(outcome.base_port, 63000);

        let written = paths.store().read_all().expect("read");
        for var in ["N8N_SCALE", "N8N_WORKER_SCALE", "N8N_INIT_SCALE", "WEAVIATE_SCALE"] {
            assert_eq!(written.get(var).map(String::as_str), Some("0"), "{}", var);
        }
        assert_eq!(written.get("KONG_HTTP_PORT").map(String::as_str), Some("63002"));
        assert_eq!(written.get("N8N_SOURCE").map(String::as_str), Some("container"));

        let gateway = fs::read_to_string(&paths.gateway).expect("gateway");
        assert!(!gateway.contains("n8n-api"));
        assert!(gateway.contains("searxng-api"));
    }

    #[test]
    fn missing_settings_start_from_the_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "");
        run(&paths, &ResolveOptions::default(), free()).expect("resolve");
        let written = paths.store().read_all().expect("read");
        assert_eq!(written.get("PROJECT_NAME").map(String::as_str), Some("genai"));
        assert_eq!(written.get("BASE_PORT").map(String::as_str), Some("63000"));
    }

    #[test]
    fn settings_without_selectors_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "PROJECT_NAME=genai\n");
        let err = run(&paths, &ResolveOptions::default(), free()).expect_err("no selectors");
        match err.downcast_ref::<Error>() {
            Some(Error::Validation(violations)) => assert_eq!(
                violations,
                &vec!["No SOURCE configurations found".to_string()]
            ),
            other => panic!("expected Validation, got {:?}", other),
        }
    }

    #[test]
    fn invalid_selectors_abort_before_any_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = "LLM_PROVIDER_SOURCE=invalid-value\nN8N_SCALE=-1\n";
        let paths = stack(dir.path(), original);

        let err = run(&paths, &ResolveOptions::default(), free()).expect_err("invalid");
        match err.downcast_ref::<Error>() {
            Some(Error::Validation(violations)) => assert_eq!(violations.len(), 2),
            other => panic!("expected Validation, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(&paths.env_file).expect("read"), original);
        assert!(!paths.gateway.exists());
    }

    #[test]
    fn port_conflict_aborts_with_a_suggestion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "N8N_SOURCE=container\n");
        let opts = ResolveOptions {
            base_port: Some(63000),
            ..Default::default()
        };

        let err = run(&paths, &opts, Busy([63005].into_iter().collect())).expect_err("conflict");
        match err.downcast_ref::<Error>() {
            Some(Error::PortConflict {
                conflicts,
                suggestion,
                ..
            }) => {
                assert_eq!(conflicts.get("SUPABASE_STORAGE_PORT"), Some(&63005));
                assert_eq!(*suggestion, Some(50000));
            }
            other => panic!("expected PortConflict, got {:?}", other),
        }
        assert_eq!(
            fs::read_to_string(&paths.env_file).expect("read"),
            "N8N_SOURCE=container\n"
        );
    }

    #[test]
    fn ephemeral_override_shapes_the_run_but_not_the_selector() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "SEARXNG_SOURCE=container\n");
        let opts = ResolveOptions {
            overrides: [("SEARXNG_SOURCE".to_string(), "disabled".to_string())]
                .into_iter()
                .collect(),
            backup: false,
            ..Default::default()
        };

        run(&paths, &opts, free()).expect("resolve");
        let written = paths.store().read_all().expect("read");
        assert_eq!(written.get("SEARXNG_SOURCE").map(String::as_str), Some("container"));
        assert_eq!(written.get("SEARXNG_SCALE").map(String::as_str), Some("0"));
        let gateway = fs::read_to_string(&paths.gateway).expect("gateway");
        assert!(!gateway.contains("searxng-api"));
    }

    #[test]
    fn rejected_persistent_override_leaves_the_file_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "N8N_SOURCE=container\n");
        let opts = ResolveOptions {
            overrides: [("N8N_SOURCE".to_string(), "bogus".to_string())]
                .into_iter()
                .collect(),
            override_mode: OverrideMode::Persistent,
            ..Default::default()
        };

        let err = run(&paths, &opts, free()).expect_err("invalid override");
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
        assert_eq!(
            fs::read_to_string(&paths.env_file).expect("read"),
            "N8N_SOURCE=container\n"
        );
        assert!(!paths.gateway.exists());
    }

    #[test]
    fn persistent_override_is_written_with_the_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "N8N_SOURCE=container\n");
        let opts = ResolveOptions {
            overrides: [("N8N_SOURCE".to_string(), "disabled".to_string())]
                .into_iter()
                .collect(),
            override_mode: OverrideMode::Persistent,
            backup: false,
            ..Default::default()
        };

        run(&paths, &opts, free()).expect("resolve");
        let written = paths.store().read_all().expect("read");
        assert_eq!(written.get("N8N_SOURCE").map(String::as_str), Some("disabled"));
        assert_eq!(written.get("N8N_SCALE").map(String::as_str), Some("0"));
    }

    #[test]
    fn adaptive_dependent_stays_disabled_on_the_next_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = demo_settings(
            "LLM_PROVIDER_SOURCE=ollama-container-cpu",
            "LLM_PROVIDER_SOURCE=disabled",
        );
        let paths = demo_stack(dir.path(), &env);
        let opts = ResolveOptions {
            backup: false,
            ..Default::default()
        };

        for round in 1..=2 {
            let outcome = run(&paths, &opts, free()).expect("resolve");
            assert_eq!(
                outcome.resolution.disabled,
                vec!["local-deep-researcher".to_string()],
                "run {}",
                round
            );
            let written = paths.store().read_all().expect("read");
            assert_eq!(
                written.get("LOCAL_DEEP_RESEARCHER_SCALE").map(String::as_str),
                Some("0"),
                "run {}",
                round
            );
            assert_eq!(written.get("OLLAMA_SCALE").map(String::as_str), Some("0"));
        }
    }

    #[test]
    fn second_run_changes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = demo_settings("WEAVIATE_SOURCE=container", "WEAVIATE_SOURCE=disabled");
        let paths = demo_stack(dir.path(), &env);
        let opts = ResolveOptions {
            backup: false,
            ..Default::default()
        };

        let first = run(&paths, &opts, free()).expect("first run");
        assert_eq!(first.resolution.disabled, vec!["n8n".to_string()]);
        let settings_after_first = fs::read_to_string(&paths.env_file).expect("read");
        let gateway_after_first = fs::read_to_string(&paths.gateway).expect("gateway");

        let second = run(&paths, &opts, free()).expect("second run");
        assert_eq!(second.resolution.disabled, first.resolution.disabled);
        assert_eq!(second.environment, first.environment);
        assert_eq!(fs::read_to_string(&paths.env_file).expect("read"), settings_after_first);
        assert_eq!(fs::read_to_string(&paths.gateway).expect("gateway"), gateway_after_first);
    }

    #[test]
    fn external_entry_failure_keeps_the_rest_of_the_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = stack(dir.path(), "COMFYUI_SOURCE=external\n");
        let outcome = run(&paths, &ResolveOptions::default(), free()).expect("resolve");
        assert_eq!(outcome.gateway_errors.len(), 1);
        let gateway = fs::read_to_string(&paths.gateway).expect("gateway");
        assert!(!gateway.contains("comfyui-api"));
        assert!(gateway.contains("backend-api"));
    }
}
