//! yiyan CLI: a random quote, read aloud.
//!
//! Commands:
//!   yiyan quote              Print a quote (remote at most every N seconds, else cached)
//!   yiyan say [text]         Narrate text, or a fresh quote when none is given
//!   yiyan play <url|file>    Stream a URL or local file
//!   yiyan cache              Cached quote / audio counts
//!   yiyan config             Print the effective config

use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use yiyan_core::config::{self, Config};
use yiyan_core::paths;
use yiyan_core::{
    AudioCache, Coordinator, DirAudioCache, HitokotoClient, HttpSynthesizer, JsonQuoteStore, Narrator,
    PlaybackSource, PlaybackState, Quote, QuoteFeed, QuoteStore, Result,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print_usage();
        return;
    }

    let data_dir = config::data_dir();
    let outcome = Config::load(&data_dir).and_then(|config| match args[0].as_str() {
        "quote" => cmd_quote(&data_dir, &config),
        "say" => cmd_say(&data_dir, &config, &args[1..]),
        "play" => cmd_play(&config, &args[1..]),
        "cache" => cmd_cache(&data_dir),
        "config" => cmd_config(&data_dir, &config),
        other => {
            eprintln!("unknown command: {}", other);
            print_usage();
            Ok(())
        }
    });

    if let Err(e) = outcome {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_quote(data_dir: &Path, config: &Config) -> Result<()> {
    match next_quote(data_dir, config)? {
        Some(quote) => print_quote(&quote),
        None => eprintln!("no quote available (offline and nothing cached)"),
    }
    Ok(())
}

fn cmd_say(data_dir: &Path, config: &Config, args: &[String]) -> Result<()> {
    let text = if args.is_empty() {
        match next_quote(data_dir, config)? {
            Some(quote) => {
                print_quote(&quote);
                quote.hitokoto
            }
            None => {
                eprintln!("no quote available (offline and nothing cached)");
                return Ok(());
            }
        }
    } else {
        args.join(" ")
    };

    let coordinator = Arc::new(Coordinator::native());
    coordinator.set_volume(config.volume);
    let narrator = Narrator::new(
        Arc::clone(&coordinator),
        Box::new(HttpSynthesizer::new(config.speech_url.clone())),
        Box::new(DirAudioCache::new(data_dir)),
    )
    .with_voice(config.language.clone(), config.voice_name.clone());

    let ended = watch_for_end(&coordinator);
    let cached = narrator.say(&text)?;
    log::info!("yiyan: narrating ({})", if cached { "cached" } else { "synthesized" });
    wait_with_progress(&coordinator, &ended, "narrating");
    Ok(())
}

fn cmd_play(config: &Config, args: &[String]) -> Result<()> {
    if args.is_empty() {
        eprintln!("usage: yiyan play <url|file>");
        return Ok(());
    }
    let coordinator = Coordinator::native();
    coordinator.set_volume(config.volume);

    let ended = watch_for_end(&coordinator);
    coordinator.play(PlaybackSource::url(args[0].clone()))?;
    wait_with_progress(&coordinator, &ended, &args[0]);
    Ok(())
}

fn cmd_cache(data_dir: &Path) -> Result<()> {
    let quotes = JsonQuoteStore::open(paths::quotes_file(data_dir))?;
    let audio = DirAudioCache::new(data_dir);
    println!("data dir: {}", data_dir.display());
    println!("quotes:   {}", quotes.len()?);
    println!("audio:    {}", audio.len()?);
    Ok(())
}

fn cmd_config(data_dir: &Path, config: &Config) -> Result<()> {
    println!("# {}", paths::config_file(data_dir).display());
    println!("{}", serde_json::to_string_pretty(&config.to_value())?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn next_quote(data_dir: &Path, config: &Config) -> Result<Option<Quote>> {
    let store = JsonQuoteStore::open(paths::quotes_file(data_dir))?;
    let feed = QuoteFeed::new(
        Box::new(HitokotoClient::new(config.quote_url.clone())),
        Box::new(store),
        Duration::from_secs(config.fetch_interval_secs),
    )
    .with_stamp_file(paths::fetch_stamp_file(data_dir));
    feed.next()
}

fn print_quote(quote: &Quote) {
    println!("{}", quote.hitokoto);
    let attribution = quote.attribution();
    if !attribution.is_empty() {
        println!("    {}", attribution);
    }
}

/// Channel that receives every state change; `wait_with_progress` drains it.
fn watch_for_end(coordinator: &Coordinator) -> mpsc::Receiver<PlaybackState> {
    let (tx, rx) = mpsc::channel();
    // The CLI exits with the coordinator, so the subscription is never released.
    let _subscription = coordinator.on_state_change(move |state| {
        let _ = tx.send(state.clone());
    });
    rx
}

/// Block, redrawing a progress line, until playback stops.
fn wait_with_progress(coordinator: &Coordinator, changes: &mpsc::Receiver<PlaybackState>, label: &str) {
    loop {
        match changes.recv_timeout(Duration::from_millis(250)) {
            Ok(state) if !state.is_playing => break,
            Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if !coordinator.state().is_playing {
            break;
        }
        print_progress(label, coordinator.current_time(), coordinator.duration(), coordinator.volume());
    }
    print_progress(label, coordinator.current_time(), coordinator.duration(), coordinator.volume());
    println!();
}

fn print_progress(label: &str, pos: f64, dur: f64, vol: f32) {
    let bar_width = 30;
    let filled = if dur > 0.0 {
        ((pos / dur).clamp(0.0, 1.0) * bar_width as f64) as usize
    } else {
        0
    };
    let empty = bar_width - filled;

    print!(
        "\r  {}  [{}{}] {} / {}  vol: {}%    ",
        label,
        "=".repeat(filled),
        " ".repeat(empty),
        fmt_time(pos),
        fmt_time(dur),
        (vol * 100.0).round() as u32,
    );
    use std::io::Write;
    std::io::stdout().flush().ok();
}

fn fmt_time(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn print_usage() {
    println!("yiyan - one line, read aloud");
    println!();
    println!("usage: yiyan <command> [args]");
    println!();
    println!("commands:");
    println!("  quote              Print a quote");
    println!("  say [text]         Narrate text (default: a fresh quote)");
    println!("  play <url|file>    Stream a URL or local file");
    println!("  cache              Cached quote / audio counts");
    println!("  config             Print the effective config");
}
