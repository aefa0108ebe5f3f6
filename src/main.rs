use tracing_subscriber::EnvFilter;

const HELP: &str = "postdeck - schedule and publish social content from the terminal.

Usage: postdeck <command> [args] [--refresh]

Commands:
  login <token> [email]   Store an access token
  logout                  Forget the token and clear cached data
  whoami                  Show the signed-in account
  dashboard               Per-platform overview and the week ahead
  scheduled               Scheduled posts grouped by day
  content                 All generated content
  generate [platform...]  Ask the backend to generate new content
  connections             Connected platforms
  connect <platform>      Authorise a platform in the browser
  disconnect <platform>   Remove a platform connection
  plans                   Available subscription plans
  subscription            Current subscription
  subscribe <plan-id>     Start a subscription
  cancel                  Cancel the subscription
  billing                 Billing history
  upload <file>           Upload an image or video

Flags:
  --refresh               Bypass cached data
  --version, -V           Show version and exit
  --help,    -h           Show this help message

Configuration is read from the user config dir (postdeck/config.yaml);
POSTDECK_SECTION__KEY environment variables override it.";

fn main() {
    if handle_cli_flags() {
        return;
    }

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(err) = postdeck::run(args) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn handle_cli_flags() -> bool {
    let mut saw_flag = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("postdeck {}", postdeck::VERSION);
                saw_flag = true;
            }
            "--help" | "-h" => {
                println!("{HELP}");
                saw_flag = true;
            }
            _ => {}
        }
    }
    saw_flag
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("postdeck=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
