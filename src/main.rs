use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::Parser;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const ENGINE_DIR: &str = "llama.cpp";
const MODELS_DIR: &str = "models";
const DEFAULT_MODEL: &str = "models/mistral-7b-instruct-v0.2.Q4_0.gguf";
const DEFAULT_PROMPT: &str = "prompt.txt";
#[cfg(windows)]
const DEFAULT_LLAMA_CLI: &str = "llama.cpp/build/bin/Release/llama-cli.exe";
#[cfg(not(windows))]
const DEFAULT_LLAMA_CLI: &str = "llama.cpp/build/bin/llama-cli";

// Parent moves allowed when climbing from the install dir toward a root
// that holds the llama.cpp/ and models/ markers.
const ROOT_SEARCH_MAX_STEPS: usize = 4;

#[derive(Parser, Debug)]
#[command(
    name = "storygen",
    version,
    about = "Launches llama-cli on a prompt file and prints the generated text"
)]
struct Cli {
    /// Path to the GGUF model (default: models/mistral-7b-instruct-v0.2.Q4_0.gguf)
    #[arg(short = 'm', long)]
    model: Option<PathBuf>,
    /// Path to the prompt file (default: prompt.txt)
    #[arg(short = 'f', long)]
    prompt: Option<PathBuf>,
    /// Tokens to generate (default: 200)
    #[arg(short = 'n', long)]
    n_predict: Option<i64>,
    /// Sampling seed (default: 42)
    #[arg(short = 's', long)]
    seed: Option<i64>,
    /// Temperature (default: 0.7)
    #[arg(short = 't', long)]
    temp: Option<f64>,
    /// Top-p (default: 0.9)
    #[arg(short = 'p', long)]
    top_p: Option<f64>,
    /// Redirect the generated text to this file instead of printing it
    #[arg(long)]
    out: Option<PathBuf>,
    /// Print resolved paths and the assembled command
    #[arg(long)]
    verbose: bool,
    /// Stop after one exchange (default mode)
    #[arg(long, conflicts_with = "multi_turn")]
    single_turn: bool,
    /// Keep the conversation open for further turns
    #[arg(long)]
    multi_turn: bool,
    /// Pass --no-conversation to llama-cli
    #[arg(long)]
    no_conversation: bool,
    /// Config file (default: ~/.config/storygen/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum StorygenError {
    #[error("Unknown option: {0}")]
    UnknownOption(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidParameter(String),
    #[error("{kind} not found: {}", path.display())]
    MissingResource { kind: &'static str, path: PathBuf },
    #[error("empty output from llama-cli; check the executable, model, and prompt paths")]
    EmptyOutput,
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    paths: PathsConfig,
    generation: GenerationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct PathsConfig {
    llama_cli: String,
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct GenerationConfig {
    seed: i64,
    temp: f64,
    top_p: f64,
    n_predict: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: PathsConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            llama_cli: DEFAULT_LLAMA_CLI.to_string(),
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            temp: 0.7,
            top_p: 0.9,
            n_predict: 200,
        }
    }
}

#[derive(Debug)]
struct LaunchConfig {
    root: PathBuf,
    llama_cli: PathBuf,
    model: PathBuf,
    prompt: PathBuf,
    out: Option<PathBuf>,
    seed: i64,
    n_predict: i64,
    temp: f64,
    top_p: f64,
    verbose: bool,
    single_turn: bool,
    no_conversation: bool,
}

#[derive(Debug)]
enum CliOutcome {
    Run(Box<Cli>),
    ShowText(String),
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

trait ShellRunner {
    fn run(&self, command_line: &str) -> Result<CommandOutput, io::Error>;
}

struct SystemShellRunner;

impl ShellRunner for SystemShellRunner {
    fn run(&self, command_line: &str) -> Result<CommandOutput, io::Error> {
        let output = shell(command_line).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(not(windows))]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

fn main() {
    let code = match parse_cli(env::args_os()) {
        Ok(CliOutcome::ShowText(text)) => {
            print!("{text}");
            0
        }
        Ok(CliOutcome::Run(cli)) => match run(&cli, &SystemShellRunner) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("{err}");
                1
            }
        },
        Err(err) => {
            eprintln!("{err}");
            if matches!(err, StorygenError::UnknownOption(_)) {
                eprintln!("Use --help");
                2
            } else {
                1
            }
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
}

fn parse_cli<I, T>(args: I) -> Result<CliOutcome, StorygenError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Cli::try_parse_from(args) {
        Ok(cli) => Ok(CliOutcome::Run(Box::new(cli))),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                Ok(CliOutcome::ShowText(err.to_string()))
            }
            ErrorKind::UnknownArgument => {
                let option = match err.get(ContextKind::InvalidArg) {
                    Some(ContextValue::String(value)) => value.clone(),
                    _ => "?".to_string(),
                };
                Err(StorygenError::UnknownOption(option))
            }
            _ => Err(StorygenError::InvalidArgument(
                err.to_string().trim_end().to_string(),
            )),
        },
    }
}

fn run(cli: &Cli, runner: &dyn ShellRunner) -> Result<(), StorygenError> {
    let config_path = resolve_config_path(cli.config.as_ref());
    let config = load_config(&config_path)?;

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let anchor = install_dir();
    let root = resolve_root(anchor.as_deref(), &cwd, ROOT_SEARCH_MAX_STEPS, dir_has_markers);

    let launch = build_launch_config(cli, &config, &root);
    validate(&launch)?;
    check_resources(&launch)?;

    let command = build_shell_command(&launch);
    if launch.verbose {
        eprintln!("root: {}", launch.root.display());
        eprintln!("llama-cli: {}", launch.llama_cli.display());
        eprintln!("model: {}", launch.model.display());
        eprintln!("prompt: {}", launch.prompt.display());
        eprintln!("command: {command}");
    }

    match execute(&launch, &command, runner)? {
        Some(text) => print!("{text}"),
        None => {
            if let Some(out) = &launch.out {
                println!("output written to {}", out.display());
            }
        }
    }
    Ok(())
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("STORYGEN_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("STORYGEN_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("storygen");
    base
}

fn load_config(path: &Path) -> Result<Config, StorygenError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    if cfg.version != 1 {
        return Err(StorygenError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

fn install_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn dir_has_markers(dir: &Path) -> bool {
    dir.join(ENGINE_DIR).is_dir() && dir.join(MODELS_DIR).is_dir()
}

// Climbs from the install dir so behavior does not depend on where the
// launcher was invoked from; falls back to cwd rather than erroring, and
// leaves correctness to the later existence checks.
fn resolve_root<F>(anchor: Option<&Path>, cwd: &Path, max_steps: usize, has_markers: F) -> PathBuf
where
    F: Fn(&Path) -> bool,
{
    if let Some(anchor) = anchor {
        let mut candidate = anchor;
        let mut steps = 0;
        loop {
            if has_markers(candidate) {
                return candidate.to_path_buf();
            }
            if steps == max_steps {
                break;
            }
            match candidate.parent() {
                Some(parent) => candidate = parent,
                None => break,
            }
            steps += 1;
        }
    }
    cwd.to_path_buf()
}

fn resolve_against_root(path: &Path, root: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || path.is_absolute() {
        return path.to_path_buf();
    }
    root.join(path)
}

fn build_launch_config(cli: &Cli, config: &Config, root: &Path) -> LaunchConfig {
    let generation = &config.generation;
    let llama_cli = PathBuf::from(&config.paths.llama_cli);
    let model = cli
        .model
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.paths.model));
    let prompt = cli
        .prompt
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.paths.prompt));
    LaunchConfig {
        root: root.to_path_buf(),
        llama_cli: resolve_against_root(&llama_cli, root),
        model: resolve_against_root(&model, root),
        prompt: resolve_against_root(&prompt, root),
        out: cli.out.as_ref().map(|out| resolve_against_root(out, root)),
        seed: cli.seed.unwrap_or(generation.seed),
        n_predict: cli.n_predict.unwrap_or(generation.n_predict),
        temp: cli.temp.unwrap_or(generation.temp),
        top_p: cli.top_p.unwrap_or(generation.top_p),
        verbose: cli.verbose,
        single_turn: cli.single_turn || !cli.multi_turn,
        no_conversation: cli.no_conversation,
    }
}

fn validate(launch: &LaunchConfig) -> Result<(), StorygenError> {
    if launch.n_predict <= 0 {
        return Err(StorygenError::InvalidParameter(
            "n-predict must be > 0".to_string(),
        ));
    }
    // Accepting forms so NaN fails the range checks too.
    if !(launch.top_p > 0.0 && launch.top_p <= 1.0) {
        return Err(StorygenError::InvalidParameter(
            "top-p must be in (0, 1]".to_string(),
        ));
    }
    if !(launch.temp > 0.0 && launch.temp <= 5.0) {
        return Err(StorygenError::InvalidParameter(
            "temp must be > 0 (typical 0.1..2.0)".to_string(),
        ));
    }
    Ok(())
}

fn check_resources(launch: &LaunchConfig) -> Result<(), StorygenError> {
    let required: [(&'static str, &Path); 3] = [
        ("llama-cli executable", launch.llama_cli.as_path()),
        ("model file", launch.model.as_path()),
        ("prompt file", launch.prompt.as_path()),
    ];
    for (kind, path) in required {
        ensure_quotable(kind, path)?;
        if !path.exists() {
            return Err(StorygenError::MissingResource {
                kind,
                path: path.to_path_buf(),
            });
        }
    }
    if let Some(out) = &launch.out {
        // The output file need not pre-exist; the shell creates it.
        ensure_quotable("output file", out)?;
    }
    Ok(())
}

// Paths are embedded double-quoted into one flat shell string, so an
// embedded quote would change the command's meaning.
fn ensure_quotable(kind: &str, path: &Path) -> Result<(), StorygenError> {
    if path.to_string_lossy().contains('"') {
        return Err(StorygenError::InvalidParameter(format!(
            "{kind} path must not contain '\"': {}",
            path.display()
        )));
    }
    Ok(())
}

fn quote(path: &Path) -> String {
    format!("\"{}\"", path.display())
}

fn build_inner_command(launch: &LaunchConfig) -> String {
    let mut command = format!(
        "{} -m {} -f {} -n {} --seed {} --temp {:.3} --top-p {:.3}",
        quote(&launch.llama_cli),
        quote(&launch.model),
        quote(&launch.prompt),
        launch.n_predict,
        launch.seed,
        launch.temp,
        launch.top_p,
    );
    if launch.single_turn {
        // Without this the child waits on a terminal that is not attached.
        command.push_str(" --single-turn");
    }
    if launch.no_conversation {
        command.push_str(" --no-conversation");
    }
    command
}

fn build_shell_command(launch: &LaunchConfig) -> String {
    let inner = build_inner_command(launch);
    let redirected = match &launch.out {
        Some(out) => format!("{inner} > {} 2>&1", quote(out)),
        None => format!("{inner} 2>&1"),
    };
    if cfg!(windows) {
        format!("chcp 65001 >nul && {redirected}")
    } else {
        redirected
    }
}

fn execute(
    launch: &LaunchConfig,
    command: &str,
    runner: &dyn ShellRunner,
) -> Result<Option<String>, StorygenError> {
    let output = runner
        .run(command)
        .map_err(|err| StorygenError::Process(format!("failed to run shell: {err}")))?;

    if launch.out.is_some() {
        // Output went to the file; the child's status is the only signal left.
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let mut message = format!("llama-cli exited with status {}", output.status_code);
            if !stderr.is_empty() {
                message = format!("{message}: {stderr}");
            }
            return Err(StorygenError::Process(message));
        }
        return Ok(None);
    }

    let text = String::from_utf8_lossy(&output.stdout).to_string();
    if text.trim().is_empty() {
        // An empty capture usually means a broken path or command, not a
        // legitimate empty generation.
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            return Err(StorygenError::Process(stderr));
        }
        return Err(StorygenError::EmptyOutput);
    }
    Ok(Some(text))
}
