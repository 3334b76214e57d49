//! tcast-post - Publish a thread to every configured platform

use clap::{Parser, ValueEnum};
use libthreadcast::logging;
use libthreadcast::{
    ApiError, CompositeResult, Config, ImageRef, Message, PostRequest, Result, TargetResult,
    ThreadcastError, ThreadcastService,
};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

/// Validation rejected the request before anything was published
const EXIT_REJECTED: i32 = 3;
/// At least one target failed with an authentication error
const EXIT_AUTH: i32 = 2;
/// At least one target failed
const EXIT_FAILED: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tcast-post")]
#[command(version)]
#[command(about = "Publish a thread to Bluesky, Mastodon, X, LinkedIn and your feed")]
#[command(long_about = "\
tcast-post - Publish a thread to every configured platform

DESCRIPTION:
    Each CONTENT argument becomes one message of the thread; message 2
    replies to message 1, message 3 to message 2 and so on. Without
    arguments the content is read from stdin as a single message.

    The whole request is validated against every selected platform before
    anything is sent, so a thread is never left half-published because one
    platform would reject it. Platforms then publish concurrently and
    independently.

USAGE:
    tcast-post \"Hello\" \"World\" --platform mastodon,bluesky
    tcast-post \"New release\" --link https://example.com/v2 --image shot.png --alt \"Screenshot\"
    tcast-post --input thread.json --format json

    thread.json has the shape:
    {\"targets\": [\"bluesky\"], \"language\": \"en\",
     \"messages\": [{\"content\": \"Hello\", \"link\": null, \"images\": []}]}

CONFIGURATION:
    Configuration file: ~/.config/threadcast/config.toml
    (override with THREADCAST_CONFIG)

EXIT CODES:
    0 - Published to every target
    1 - At least one target failed, or a configuration/database error
    2 - At least one target rejected the credentials
    3 - Invalid request, nothing was published
")]
struct Cli {
    /// Messages of the thread, in order
    content: Vec<String>,

    /// Target platform(s), comma-separated (default: [defaults] targets)
    #[arg(short, long, value_delimiter = ',')]
    platform: Vec<String>,

    /// Link attached to the first message
    #[arg(short, long)]
    link: Option<String>,

    /// Image attached to the first message (repeatable)
    #[arg(short, long)]
    image: Vec<PathBuf>,

    /// Alt text for the images, in the same order (repeatable)
    #[arg(long)]
    alt: Vec<String>,

    /// Language of the thread (e.g. "en")
    #[arg(long)]
    lang: Option<String>,

    /// Read the whole request from a JSON file ("-" for stdin)
    #[arg(long, conflicts_with_all = ["content", "link", "image", "alt"])]
    input: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init_default(cli.verbose);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let request = build_request(&cli)?;
    debug!(
        targets = ?request.targets,
        messages = request.messages.len(),
        "request built"
    );

    let config = Config::load()?;
    let service = ThreadcastService::from_config(config).await?;

    match service.broadcast(&request).await {
        Ok(result) => {
            print_result(&result, cli.format);
            Ok(exit_code(&result))
        }
        Err(rejected) => {
            print_rejection(&rejected, cli.format);
            Ok(EXIT_REJECTED)
        }
    }
}

fn build_request(cli: &Cli) -> Result<PostRequest> {
    let mut request = match &cli.input {
        Some(path) => read_request(path)?,
        None => PostRequest {
            targets: Vec::new(),
            language: None,
            messages: build_messages(cli)?,
        },
    };

    if !cli.platform.is_empty() {
        request.targets = cli.platform.clone();
    }
    if cli.lang.is_some() {
        request.language = cli.lang.clone();
    }
    Ok(request)
}

fn build_messages(cli: &Cli) -> Result<Vec<Message>> {
    let contents = if cli.content.is_empty() {
        vec![read_stdin()?]
    } else {
        cli.content.clone()
    };

    if cli.alt.len() > cli.image.len() {
        return Err(ThreadcastError::InvalidInput(format!(
            "{} alt texts given for {} images",
            cli.alt.len(),
            cli.image.len()
        )));
    }

    let mut messages: Vec<Message> = contents.into_iter().map(Message::new).collect();
    if let Some(first) = messages.first_mut() {
        first.link = cli.link.clone();
        first.images = cli
            .image
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let image = ImageRef::new(path.to_string_lossy());
                match cli.alt.get(i) {
                    Some(alt) => image.with_alt_text(alt.clone()),
                    None => image,
                }
            })
            .collect();
    }
    Ok(messages)
}

fn read_stdin() -> Result<String> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .map_err(|e| ThreadcastError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    Ok(content.trim_end().to_string())
}

fn read_request(path: &PathBuf) -> Result<PostRequest> {
    let raw = if path.as_os_str() == "-" {
        read_stdin()?
    } else {
        std::fs::read_to_string(path).map_err(|e| {
            ThreadcastError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?
    };
    serde_json::from_str(&raw).map_err(|e| {
        ThreadcastError::InvalidInput(format!("Invalid request in {}: {}", path.display(), e))
    })
}

fn exit_code(result: &CompositeResult) -> i32 {
    if result.is_success() {
        0
    } else if result.failures().any(|(_, e)| e.status == 401) {
        EXIT_AUTH
    } else {
        EXIT_FAILED
    }
}

fn print_result(result: &CompositeResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let output = json!({
                "status": result.status(),
                "outcomes": result.outcomes,
            });
            println!("{}", output);
        }
        OutputFormat::Text => {
            for (target, outcome) in &result.outcomes {
                match outcome {
                    TargetResult::Success(posts) => {
                        for post in posts {
                            let link = post.url.as_deref().or(post.uri.as_deref()).unwrap_or("");
                            println!("{}:{} {}", target, post.post_id, link);
                        }
                    }
                    TargetResult::Failure(error) => {
                        eprintln!("{}: failed (HTTP {}): {}", target, error.status, error.message);
                    }
                }
            }
        }
    }
}

fn print_rejection(error: &ApiError, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", json!({ "status": error.status, "error": error })),
        OutputFormat::Text => eprintln!("Rejected: {}", error.message),
    }
}
