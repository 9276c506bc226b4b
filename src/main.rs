use anyhow::{anyhow, Context, Error};
use clap::Parser;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod container;
mod observer;
mod process;
mod unpack;

const APP_NAME: &str = env!("CARGO_BIN_NAME");
const LOG_VAR: &str = "UPK_DL_LOG";

#[derive(Debug, Parser)]
#[clap(name = APP_NAME, version, about)]
struct App {
    /// Directory to extract the package contents into.
    #[clap(short, long, default_value = "./out")]
    output: PathBuf,

    /// Increase logging verbosity
    #[clap(short, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Decrease logging verbosity
    #[clap(short, action = clap::ArgAction::Count)]
    quietness: u8,

    /// The UPK package file to unpack.
    #[clap(name = "FILE")]
    file: PathBuf,
}

impl App {
    #[culpa::throws]
    #[tracing::instrument(fields(%self))]
    fn run(self) {
        if self.file.extension().is_none_or(|ext| ext != "upk") {
            culpa::throw!(anyhow!("{} does not end in .upk", self.file.display()));
        }

        let data = std::fs::read(&self.file)
            .with_context(|| format!("reading {}", self.file.display()))?;
        tracing::debug!("file {} size:{}b", self.file.display(), data.len());

        std::fs::create_dir_all(&self.output)
            .with_context(|| format!("creating output directory {}", self.output.display()))?;

        let mut container = container::Container::new(data)?;
        let mut dispatcher = process::Dispatcher::new(&self.output, observer::LogObserver);
        while let Some(record) = container.next_record()? {
            dispatcher.dispatch(&record)?;
        }
    }

    fn log_level(&self) -> LevelFilter {
        const LEVELS: [LevelFilter; 6] = [
            LevelFilter::OFF,
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ];
        LEVELS[usize::try_from(
            (2 - i32::from(self.quietness) + i32::from(self.verbosity))
                .clamp(0, i32::try_from(LEVELS.len() - 1).unwrap()),
        )
        .expect("clamped into range")]
    }

    #[culpa::throws]
    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new("WARN").add_directive(self.log_level().into());
        if let Some(directive) = get_env_directive(LOG_VAR)? {
            filter = filter.add_directive(directive);
        }
        filter
    }
}

impl std::fmt::Display for App {
    #[culpa::throws(std::fmt::Error)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) {
        write!(f, "{}", APP_NAME)?;
        write!(f, " --output={:?}", self.output)?;
        for _ in 0..self.verbosity {
            write!(f, " -v")?;
        }
        for _ in 0..self.quietness {
            write!(f, " -q")?;
        }
        write!(f, " {}", self.file.display())?;
    }
}

#[culpa::throws]
#[fn_error_context::context("parsing directive {:?}", directive)]
fn parse_directive(directive: &str) -> tracing_subscriber::filter::Directive {
    directive.parse()?
}

#[culpa::throws]
#[fn_error_context::context("getting directive from env var {:?}", var)]
fn get_env_directive(var: &str) -> Option<tracing_subscriber::filter::Directive> {
    if let Some(value) = std::env::var_os(var) {
        let s = value.to_str().context("value is not unicode")?;
        Some(parse_directive(s)?)
    } else {
        None
    }
}

fn base_env_filter() -> EnvFilter {
    let mut filter = EnvFilter::new("WARN");
    // Silently ignore any errors at this point, they will be caught later when reconstructing the
    // filter
    if let Ok(Some(directive)) = get_env_directive(LOG_VAR) {
        filter = filter.add_directive(directive);
    }
    filter
}

#[culpa::throws]
fn main() {
    let (app, filter) = tracing::subscriber::with_default(
        tracing_subscriber::fmt()
            .with_env_filter(base_env_filter())
            .with_writer(std::io::stderr)
            .pretty()
            .finish(),
        || {
            let app = App::parse();
            app.env_filter().map(|filter| (app, filter))
        },
    )?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
    app.run()?;
}
