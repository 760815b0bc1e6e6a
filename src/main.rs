use anyhow::{bail, Context};
use browser_remix::assistant::{
    ChatModel, ElementCode, ElementStore, Orchestrator, ProviderClient, SettingsStore,
};
use browser_remix::browser::{ChromeBrowser, ChromePage, ContentAgent};
use browser_remix::core::{Config, JsonFileStore, Provider};
use browser_remix::inject::{serve_assistant_calls, AssistantBridge};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STORE: &str = "browser-remix.json";

fn cli() -> Command {
    Command::new("browser-remix")
        .about("Customize web pages by describing the change")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("JSON file with engine tunables"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .global(true)
                .default_value(DEFAULT_STORE)
                .help("Where elements, conversations and settings are kept"),
        )
        .arg(
            Arg::new("headed")
                .long("headed")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Show the browser window"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("chat")
                .about("Open a page and chat with the assistant about it")
                .arg(Arg::new("url").required(true))
                .arg(
                    Arg::new("prompt")
                        .num_args(0..)
                        .help("Prompts to send; reads stdin line by line when omitted"),
                ),
        )
        .subcommand(
            Command::new("open")
                .about("Open a page with its saved elements applied until Ctrl-C")
                .arg(Arg::new("url").required(true)),
        )
        .subcommand(
            Command::new("list")
                .about("List saved elements")
                .arg(Arg::new("url").long("url").help("Only elements for this page")),
        )
        .subcommand(
            Command::new("toggle")
                .about("Enable or disable an element")
                .arg(Arg::new("id").required(true))
                .arg(
                    Arg::new("off")
                        .long("off")
                        .action(ArgAction::SetTrue)
                        .help("Disable instead of enable"),
                ),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete an element")
                .arg(Arg::new("id").required(true)),
        )
        .subcommand(
            Command::new("edit")
                .about("Replace an element's code from files")
                .arg(Arg::new("id").required(true))
                .arg(Arg::new("js").long("js").help("File with the new JavaScript"))
                .arg(Arg::new("css").long("css").help("File with the new CSS")),
        )
        .subcommand(
            Command::new("settings")
                .about("Show or change provider settings")
                .arg(Arg::new("provider").long("provider"))
                .arg(Arg::new("api-key").long("api-key"))
                .arg(Arg::new("model").long("model"))
                .arg(Arg::new("base-url").long("base-url"))
                .arg(
                    Arg::new("allow-element-access")
                        .long("allow-element-access")
                        .value_parser(clap::value_parser!(bool))
                        .help("Let injected elements call the assistant"),
                ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("reading {path}"))?,
        None => Config::default(),
    };
    if matches.get_flag("headed") {
        config.browser.headless = false;
    }
    let store_path = matches
        .get_one::<String>("store")
        .map(String::as_str)
        .unwrap_or(DEFAULT_STORE);
    let store = Arc::new(JsonFileStore::new(store_path));

    match matches.subcommand() {
        Some(("chat", sub)) => chat(config, store, sub).await,
        Some(("open", sub)) => open(config, store, sub).await,
        Some(("list", sub)) => list(store, sub).await,
        Some(("toggle", sub)) => toggle(store, sub).await,
        Some(("delete", sub)) => delete(store, sub).await,
        Some(("edit", sub)) => edit(store, sub).await,
        Some(("settings", sub)) => settings(store, sub).await,
        _ => unreachable!("a subcommand is required"),
    }
}

/// A live tab with navigation watching and the `callAssistant` relay running.
struct LiveSession {
    _browser: ChromeBrowser,
    agent: Arc<ContentAgent<ChromePage, JsonFileStore>>,
    model: Arc<dyn ChatModel>,
    cancel: CancellationToken,
}

impl LiveSession {
    async fn start(config: &Config, store: Arc<JsonFileStore>, url: &str) -> anyhow::Result<Self> {
        let browser = ChromeBrowser::launch(&config.browser)?;
        info!("Opening {}", url);
        let page = browser.open(url).await?;

        let agent = Arc::new(ContentAgent::new(page, store.clone(), config));
        let applied = agent.autoload().await?;
        info!("Applied {} saved elements", applied);

        let cancel = CancellationToken::new();
        let watcher = agent.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.watch_navigation(watch_cancel).await {
                error!("Navigation watcher stopped: {}", e);
            }
        });

        let model: Arc<dyn ChatModel> = Arc::new(ProviderClient::new(
            config.assistant.temperature,
            config.assistant.max_tokens,
        )?);
        let (bridge, endpoint) = AssistantBridge::channel(16);
        tokio::spawn(serve_assistant_calls(
            endpoint,
            model.clone(),
            SettingsStore::new(store).with_env_overrides(),
        ));
        tokio::spawn(agent.clone().relay_assistant_calls(Arc::new(bridge), cancel.clone()));

        Ok(Self {
            _browser: browser,
            agent,
            model,
            cancel,
        })
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn chat(config: Config, store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let url = required(args, "url")?;
    let session = LiveSession::start(&config, store.clone(), url).await?;
    let orchestrator = Orchestrator::new(
        session.agent.clone(),
        session.model.clone(),
        store,
        config.assistant.clone(),
    )
    .with_env_overrides();

    let prompts: Vec<String> = args
        .get_many::<String>("prompt")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    if !prompts.is_empty() {
        for prompt in prompts {
            run_prompt(&orchestrator, &prompt).await?;
        }
        return Ok(());
    }

    println!("Describe a change to the page (empty line to quit):");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            break;
        }
        run_prompt(&orchestrator, prompt).await?;
    }
    Ok(())
}

async fn run_prompt(
    orchestrator: &Orchestrator<ContentAgent<ChromePage, JsonFileStore>, JsonFileStore>,
    prompt: &str,
) -> anyhow::Result<()> {
    match orchestrator.run_turn(prompt).await {
        Ok(outcome) => {
            println!("{}", outcome.message);
            if let Some(element) = &outcome.element {
                println!("  [{:?}] {} ({})", outcome.action, element.name, element.id);
            }
            Ok(())
        }
        Err(e) if e.is_user_actionable() => {
            warn!("{}", e);
            println!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn open(config: Config, store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let url = required(args, "url")?;
    let session = LiveSession::start(&config, store, url).await?;
    info!("Watching the page; press Ctrl-C to quit");
    tokio::signal::ctrl_c().await?;

    let unsettled = session.agent.engine().active_tasks().await;
    if !unsettled.is_empty() {
        warn!("Elements still retrying at exit: {}", unsettled.join(", "));
    }
    Ok(())
}

async fn list(store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let elements = ElementStore::new(store);
    let listed = match args.get_one::<String>("url") {
        Some(url) => elements.all_for_url(url).await?,
        None => elements.list().await?,
    };
    if listed.is_empty() {
        println!("No elements saved");
    }
    for element in listed {
        println!(
            "{} {} [{}] {}",
            element.id,
            if element.enabled { "on " } else { "off" },
            element.name,
            element.url
        );
    }
    Ok(())
}

async fn toggle(store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let id = required(args, "id")?;
    let enabled = !args.get_flag("off");
    match ElementStore::new(store).set_enabled(id, enabled).await? {
        Some(element) => {
            let state = if enabled { "enabled" } else { "disabled" };
            println!("{} is now {}", element.id, state);
        }
        None => bail!("no element {id}"),
    }
    Ok(())
}

async fn delete(store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let id = required(args, "id")?;
    match ElementStore::new(store).delete(id).await? {
        Some(element) => println!("Deleted {} ({})", element.id, element.name),
        None => bail!("no element {id}"),
    }
    Ok(())
}

async fn edit(store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let id = required(args, "id")?;
    let elements = ElementStore::new(store);
    let Some(existing) = elements.get(id).await? else {
        bail!("no element {id}");
    };

    let mut code: ElementCode = existing.code.clone();
    if let Some(path) = args.get_one::<String>("js") {
        code.js = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {path}"))?;
    }
    if let Some(path) = args.get_one::<String>("css") {
        code.css = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {path}"))?;
    }

    if code.same_as(&existing.code) {
        println!("Code unchanged");
        return Ok(());
    }
    elements.replace_code(id, code).await?;
    println!("Updated {}; it applies on the next page load", id);
    Ok(())
}

async fn settings(store: Arc<JsonFileStore>, args: &ArgMatches) -> anyhow::Result<()> {
    let settings_store = SettingsStore::new(store);
    let mut settings = settings_store.load().await?;
    let mut changed = false;

    if let Some(name) = args.get_one::<String>("provider") {
        settings.provider =
            Provider::parse(name).with_context(|| format!("unknown provider {name}"))?;
        changed = true;
    }
    if let Some(key) = args.get_one::<String>("api-key") {
        settings.api_key = key.clone();
        changed = true;
    }
    if let Some(model) = args.get_one::<String>("model") {
        settings.model = model.clone();
        changed = true;
    }
    if let Some(base_url) = args.get_one::<String>("base-url") {
        settings.base_url = Some(base_url.clone()).filter(|u| !u.trim().is_empty());
        changed = true;
    }
    if let Some(allow) = args.get_one::<bool>("allow-element-access") {
        settings.allow_element_llm_access = *allow;
        changed = true;
    }

    if changed {
        settings_store.save(&settings).await?;
        info!("Settings saved");
    }

    println!("provider:       {:?}", settings.provider);
    println!("model:          {}", settings.effective_model());
    println!(
        "base url:       {}",
        settings.effective_base_url().unwrap_or_else(|| "(none)".to_string())
    );
    println!("api key:        {}", settings.masked_key());
    println!("element access: {}", settings.allow_element_llm_access);
    Ok(())
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing {name}"))
}
