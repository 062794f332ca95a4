use console::style;
use log::{debug, info};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tool_sandbox::utils::parse_memory_size;
use tool_sandbox::{
    EngineConfig, ExecutionEngine, ExecutionRequest, ExecutionResult, StaticPolicy,
    StaticRegistry, TrustTier,
};

/// Configuration for one command-line run
pub struct RunConfig {
    pub config: Option<PathBuf>,
    pub tool_id: String,
    pub tools: PathBuf,
    pub policy: PathBuf,
    pub principal: String,
    pub args: String,
    pub tier: String,
    pub timeout: Option<u64>,
    pub memory: Option<String>,
    pub json: bool,
}

/// Load engine configuration from `path`, or defaults
pub fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            debug!("Loading engine configuration from {}", path.display());
            Ok(EngineConfig::from_file(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

/// Build the request described by the command line
pub fn build_request(config: &RunConfig) -> Result<ExecutionRequest, Box<dyn std::error::Error>> {
    let arguments: Map<String, Value> = match serde_json::from_str(&config.args)? {
        Value::Object(map) => map,
        other => return Err(format!("--args must be a JSON object, got {}", other).into()),
    };
    let tier: TrustTier = config.tier.parse()?;

    let mut request = ExecutionRequest::new(&config.tool_id, &config.principal, arguments)
        .with_trust_tier(tier);

    if let Some(t) = config.timeout {
        debug!("Overriding timeout: {}s", t);
        request = request.with_timeout_s(t);
    }

    if let Some(m) = &config.memory {
        debug!("Overriding memory limit: {}", m);
        let bytes = parse_memory_size(m)?;
        request = request.with_memory_limit_mb(bytes.div_ceil(1024 * 1024));
    }

    request.validate()?;
    Ok(request)
}

/// Execute the request and return the process exit code
pub fn run_tool(config: RunConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let engine_config = load_config(config.config.as_ref())?;
    let registry = StaticRegistry::from_dir(&config.tools)?;
    let policy = StaticPolicy::from_file(&config.policy)?;
    let request = build_request(&config)?;

    let engine = ExecutionEngine::builder(engine_config)
        .gate(Arc::new(policy))
        .registry(Arc::new(registry))
        .build()?;

    info!(
        "Executing '{}' for '{}' at {} tier",
        request.tool_id(),
        request.principal_id(),
        request.trust_tier()
    );
    let result = engine.execute(&request, None);

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(if result.success { 0 } else { 1 })
}

fn print_result(result: &ExecutionResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }

    for artifact in &result.artifacts {
        println!(
            "{} {} ({} bytes){}",
            style("artifact").dim(),
            style(artifact.path.display()).bold(),
            artifact.size,
            artifact
                .exported_to
                .as_ref()
                .map(|p| format!(" -> {}", p.display()))
                .unwrap_or_default()
        );
    }
    for warning in &result.warnings {
        println!("{} {}", style("warning").yellow(), warning);
    }

    let status = if result.success {
        style("success".to_string()).green().bold()
    } else {
        style(
            result
                .error_kind
                .map(|k| k.to_string())
                .unwrap_or_else(|| "failed".to_string()),
        )
        .red()
        .bold()
    };

    print!(
        "{}={} | {}={} | {}={}",
        style("status").dim(),
        status,
        style("wall_time_ms").dim(),
        style(result.wall_time_ms).bold(),
        style("cpu_time_ms").dim(),
        style(result.cpu_time_ms).bold(),
    );
    if let Some(code) = result.exit_code {
        print!(" | {}={}", style("exit_code").dim(), style(code).bold());
    }
    if let Some(signal) = result.signal {
        print!(" | {}={}", style("signal").dim(), style(signal).red().bold());
    }
    println!();

    if !result.diagnostic_message.is_empty() {
        println!("{} {}", style("diagnostic").dim(), result.diagnostic_message);
    }
}
