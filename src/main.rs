//! Command-line interface for the media fusion pipeline
//!
//! Offline commands build filmstrips and adaptive layouts from files; the
//! `live` command runs the full chunk, analysis and clip pipeline against a
//! UDP stream.

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use tracing::{debug, info, warn};
use rust_mediafusion::{
    create_chunk_filmstrip, init_tracing, AdaptiveConfig, AdaptiveFilmstripProcessor, AdaptiveRun,
    DetectionMethod, FilmstripConfig, HttpModelClient, LivePipeline, PipelineConfig, ShotChangeDetector,
};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Filmstrip { video_path: String },
    Layout,
    Adaptive { video_path: String },
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Simple,
    Detailed,
    Json,
}

/// Command-line arguments structure
#[derive(Debug)]
struct Args {
    command: Command,
    output: Option<PathBuf>,
    config_path: Option<PathBuf>,
    start_time: f64,
    duration: Option<f64>,
    fps: Option<f64>,
    resolution: Option<(u32, u32)>,
    max_grid_size: Option<(u32, u32)>,
    max_grid_images: Option<u32>,
    threshold: Option<f64>,
    method: Option<DetectionMethod>,
    detect_shots: bool,
    port: Option<u16>,
    keep_chapters: Option<usize>,
    verbose: bool,
    output_format: OutputFormat,
}

impl Args {
    fn new(command: Command) -> Self {
        Self {
            command,
            output: None,
            config_path: None,
            start_time: 0.0,
            duration: None,
            fps: None,
            resolution: None,
            max_grid_size: None,
            max_grid_images: None,
            threshold: None,
            method: None,
            detect_shots: true,
            port: None,
            keep_chapters: None,
            verbose: false,
            output_format: OutputFormat::Simple,
        }
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {0} <command> [OPTIONS]\n\n\
        Commands:\n\
        filmstrip <video>        One labelled grid for a chunk, with shot changes\n\
        layout                   Compute an adaptive grid layout (JSON)\n\
        adaptive <video>         Adaptive filmstrips for a whole video\n\
        live                     Run the live pipeline on a UDP stream\n\n\
        Options:\n\
        --output <path>          Output file (filmstrip), prefix (adaptive) or directory (live)\n\
        --config <file>          JSON config (live: pipeline, adaptive/layout: adaptive config)\n\
        --start <secs>           Start time of the sampled span (default: 0)\n\
        --duration <secs>        Span to cover\n\
        --fps <value>            Source frame rate (layout)\n\
        --resolution <WxH>       Source resolution (layout)\n\
        --max-grid <WxH>         Largest grid image (default: 8000x8000)\n\
        --max-images <n>         Most grid images to produce (default: 20)\n\
        --threshold <value>      Shot change threshold (default: 0.7)\n\
        --method <m>             Shot detection: histogram|mse (default: histogram)\n\
        --no-shots               Skip shot change detection\n\
        --port <n>               UDP port (live)\n\
        --keep-chapters <n>      Finalized chapters kept in model context (live)\n\
        --format <fmt>           Output format: simple|detailed|json (default: simple)\n\
        --verbose                Enable debug logging\n\
        --help                   Show this help message\n\n\
        Examples:\n\
        {0} filmstrip chunk_0000_20s.mp4 --output filmstrip.jpg\n\
        {0} layout --duration 600 --fps 30 --resolution 1920x1080\n\
        {0} live --config pipeline.json --keep-chapters 3",
        program
    )
}

fn main() {
    let result = run();

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let argv: Vec<String> = env::args().collect();
    let args = parse_args(&argv).map_err(|e| anyhow!(e))?;

    let log_level = if args.verbose { "debug" } else { "info" };
    init_tracing(log_level);

    info!("Media fusion CLI v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match args.command.clone() {
        Command::Filmstrip { video_path } => run_filmstrip(&args, &video_path),
        Command::Layout => run_layout(&args),
        Command::Adaptive { video_path } => run_adaptive(&args, &video_path),
        Command::Live => run_live(&args),
    }
}

fn next_value<'a>(argv: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    argv.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag))
}

fn parse_pair(value: &str, flag: &str) -> Result<(u32, u32), String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("{} expects WIDTHxHEIGHT", flag))?;
    let w = w.parse().map_err(|_| format!("Invalid width for {}", flag))?;
    let h = h.parse().map_err(|_| format!("Invalid height for {}", flag))?;
    Ok((w, h))
}

fn parse_args(argv: &[String]) -> Result<Args, String> {
    let program = argv.first().map(String::as_str).unwrap_or("rust-mediafusion");

    let Some(command) = argv.get(1) else {
        return Err(usage(program));
    };

    let (command, mut i) = match command.as_str() {
        "filmstrip" | "adaptive" => {
            let video_path = argv
                .get(2)
                .filter(|p| !p.starts_with("--"))
                .cloned()
                .ok_or_else(|| format!("{} requires a video path", command))?;
            let command = if command == "filmstrip" {
                Command::Filmstrip { video_path }
            } else {
                Command::Adaptive { video_path }
            };
            (command, 3)
        }
        "layout" => (Command::Layout, 2),
        "live" => (Command::Live, 2),
        "--help" | "help" => return Err(usage(program)),
        other => return Err(format!("Unknown command: {}\n\n{}", other, usage(program))),
    };

    let mut parsed = Args::new(command);

    while i < argv.len() {
        let flag = argv[i].as_str();
        match flag {
            "--output" => {
                parsed.output = Some(PathBuf::from(next_value(argv, i, flag)?));
                i += 2;
            }
            "--config" => {
                parsed.config_path = Some(PathBuf::from(next_value(argv, i, flag)?));
                i += 2;
            }
            "--start" => {
                parsed.start_time = next_value(argv, i, flag)?
                    .parse()
                    .map_err(|_| "Invalid start time")?;
                i += 2;
            }
            "--duration" => {
                parsed.duration = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid duration")?);
                i += 2;
            }
            "--fps" => {
                parsed.fps = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid fps")?);
                i += 2;
            }
            "--resolution" => {
                parsed.resolution = Some(parse_pair(next_value(argv, i, flag)?, flag)?);
                i += 2;
            }
            "--max-grid" => {
                parsed.max_grid_size = Some(parse_pair(next_value(argv, i, flag)?, flag)?);
                i += 2;
            }
            "--max-images" => {
                parsed.max_grid_images = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid max-images value")?);
                i += 2;
            }
            "--threshold" => {
                parsed.threshold = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid threshold value")?);
                i += 2;
            }
            "--method" => {
                parsed.method = Some(next_value(argv, i, flag)?.parse().map_err(|e| format!("{}", e))?);
                i += 2;
            }
            "--no-shots" => {
                parsed.detect_shots = false;
                i += 1;
            }
            "--port" => {
                parsed.port = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid port")?);
                i += 2;
            }
            "--keep-chapters" => {
                parsed.keep_chapters = Some(next_value(argv, i, flag)?.parse().map_err(|_| "Invalid keep-chapters value")?);
                i += 2;
            }
            "--format" => {
                parsed.output_format = match next_value(argv, i, flag)? {
                    "simple" => OutputFormat::Simple,
                    "detailed" => OutputFormat::Detailed,
                    "json" => OutputFormat::Json,
                    _ => return Err("Invalid format. Use 'simple', 'detailed', or 'json'".to_string()),
                };
                i += 2;
            }
            "--verbose" => {
                parsed.verbose = true;
                i += 1;
            }
            "--help" => return Err(usage(program)),
            _ => return Err(format!("Unknown option: {}", argv[i])),
        }
    }

    Ok(parsed)
}

fn filmstrip_config(args: &Args) -> FilmstripConfig {
    let mut config = FilmstripConfig::default();
    if let Some(method) = args.method {
        config.detection_method = method;
    }
    config.detect_shot_changes = args.detect_shots;
    if let Some(threshold) = args.threshold {
        config.shot_threshold = threshold;
    }
    config
}

fn adaptive_config(args: &Args) -> Result<AdaptiveConfig> {
    let mut config = match &args.config_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => AdaptiveConfig::default(),
    };
    if let Some(size) = args.max_grid_size {
        config.max_grid_size = size;
    }
    if let Some(n) = args.max_grid_images {
        config.max_grid_images = n;
    }
    Ok(config)
}

fn run_filmstrip(args: &Args, video_path: &str) -> Result<()> {
    let config = filmstrip_config(args);
    if !(config.shot_threshold >= 0.0) {
        bail!("threshold must be non-negative");
    }
    let output = args.output.clone().unwrap_or_else(|| PathBuf::from("filmstrip.jpg"));

    let started = Instant::now();
    let shots = create_chunk_filmstrip(video_path, &output, args.start_time, &config)
        .with_context(|| format!("creating filmstrip for {}", video_path))?;
    let elapsed = started.elapsed();

    match args.output_format {
        OutputFormat::Simple => {
            println!("Shot changes detected at grid cells: {:?}", shots);
        }
        OutputFormat::Detailed => {
            println!("Filmstrip Results:");
            println!("  Output: {}", output.display());
            println!("  Processing time: {}ms", elapsed.as_millis());
            println!("  Grid: {}x{}", config.style.rows, config.style.cols);
            if shots.is_empty() {
                println!("  No shot changes detected");
            } else {
                for idx in &shots {
                    let at = args.start_time + (*idx as f64 + 0.5) * config.frame_interval_secs;
                    println!(
                        "    Cell {}x{} (frame {}): {:.2}s",
                        idx / config.style.cols as usize + 1,
                        idx % config.style.cols as usize + 1,
                        idx,
                        at
                    );
                }
            }
        }
        OutputFormat::Json => {
            let json_output = serde_json::json!({
                "video_path": video_path,
                "output": output,
                "processing_time_ms": elapsed.as_millis(),
                "shot_changes": shots,
                "config": {
                    "rows": config.style.rows,
                    "cols": config.style.cols,
                    "method": config.detection_method,
                    "threshold": config.shot_threshold,
                    "start_time": args.start_time,
                }
            });
            println!("{}", serde_json::to_string_pretty(&json_output)?);
        }
    }

    info!("Filmstrip completed in {}ms, {} shot changes", elapsed.as_millis(), shots.len());
    Ok(())
}

fn run_layout(args: &Args) -> Result<()> {
    let duration = args.duration.context("layout requires --duration")?;
    let fps = args.fps.unwrap_or(30.0);
    let resolution = args.resolution.unwrap_or((1920, 1080));

    let processor = AdaptiveFilmstripProcessor::new(adaptive_config(args)?, None)?;
    let layout = processor.calculate_optimal_layout(duration, fps, resolution)?;
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}

fn run_adaptive(args: &Args, video_path: &str) -> Result<()> {
    let detector = args
        .detect_shots
        .then(|| ShotChangeDetector::new(args.method.unwrap_or_default(), args.threshold.unwrap_or(0.7), false));
    let mut processor = AdaptiveFilmstripProcessor::new(adaptive_config(args)?, detector)?;

    let prefix = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from("adaptive_filmstrip"));
    let run = AdaptiveRun {
        detect_shot_changes: args.detect_shots,
        start_time: args.start_time,
        process_duration: args.duration,
        ..AdaptiveRun::default()
    };

    let started = Instant::now();
    let result = processor
        .create_adaptive_filmstrips(video_path, &prefix.to_string_lossy(), &run)
        .with_context(|| format!("creating adaptive filmstrips for {}", video_path))?;

    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => {
            println!("Created {} grid(s) in {}ms", result.output_files.len(), started.elapsed().as_millis());
            for grid in &result.grids {
                println!(
                    "  {} frames {}-{}, {} shot change(s)",
                    grid.output_file.display(),
                    grid.frame_range.0,
                    grid.frame_range.1,
                    grid.shot_changes.len()
                );
            }
        }
    }
    Ok(())
}

fn run_live(args: &Args) -> Result<()> {
    let mut config = match &args.config_path {
        Some(path) => PipelineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.output {
        config.output_dir = dir.clone();
    }
    if let Some(port) = args.port {
        config.chunk.udp_port = port;
    }
    if args.keep_chapters.is_some() {
        config.analyzer.keep_n_chapters = args.keep_chapters;
    }
    if let Some(threshold) = args.threshold {
        config.filmstrip.shot_threshold = threshold;
    }
    if let Some(method) = args.method {
        config.filmstrip.detection_method = method;
    }
    config.filmstrip.detect_shot_changes &= args.detect_shots;

    let client = HttpModelClient::from_config(&config.model).context("configuring the model client")?;
    let mut pipeline = LivePipeline::new(config, Box::new(client))?;
    let summary = pipeline.run()?;

    if summary.chapters.is_empty() {
        warn!("The session produced no chapters");
    }

    match args.output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            println!("Session Results:");
            println!("  Chunks analysed: {}", summary.chunks_analyzed);
            println!("  Failed chunks: {:?}", summary.failed_chunks);
            println!("  Chapters: {}", summary.chapters.len());
            for (i, chapter) in summary.chapters.iter().enumerate() {
                println!("    {}. {} ({} topics)", i + 1, chapter.chapter, chapter.topics.len());
            }
            if args.output_format == OutputFormat::Detailed {
                print!("{}", summary.usage.render());
                if let Some(text) = &summary.final_summary {
                    println!("\n{}", text);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_filmstrip() {
        let args = parse_args(&argv(&[
            "rust-mediafusion", "filmstrip", "chunk.mp4", "--threshold", "0.5", "--method", "mse", "--format", "json",
        ]))
        .unwrap();

        assert_eq!(args.command, Command::Filmstrip { video_path: "chunk.mp4".to_string() });
        assert_eq!(args.threshold, Some(0.5));
        assert_eq!(args.method, Some(DetectionMethod::Mse));
        assert_eq!(args.output_format, OutputFormat::Json);

        let config = filmstrip_config(&args);
        assert_eq!(config.shot_threshold, 0.5);
        assert_eq!(config.detection_method, DetectionMethod::Mse);
    }

    #[test]
    fn test_parse_layout_pairs() {
        let args = parse_args(&argv(&[
            "rust-mediafusion", "layout", "--duration", "600", "--resolution", "1280x720", "--max-grid", "4000X4000",
        ]))
        .unwrap();
        assert_eq!(args.command, Command::Layout);
        assert_eq!(args.resolution, Some((1280, 720)));
        assert_eq!(adaptive_config(&args).unwrap().max_grid_size, (4000, 4000));
    }

    #[test]
    fn test_parse_live() {
        let args = parse_args(&argv(&["rust-mediafusion", "live", "--port", "5000", "--keep-chapters", "3", "--no-shots"])).unwrap();
        assert_eq!(args.command, Command::Live);
        assert_eq!(args.port, Some(5000));
        assert_eq!(args.keep_chapters, Some(3));
        assert!(!args.detect_shots);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&argv(&["rust-mediafusion"])).unwrap_err().starts_with("Usage:"));
        assert!(parse_args(&argv(&["rust-mediafusion", "filmstrip"])).is_err());
        assert!(parse_args(&argv(&["rust-mediafusion", "filmstrip", "--verbose"])).is_err());
        assert!(parse_args(&argv(&["rust-mediafusion", "live", "--port"])).unwrap_err().contains("requires a value"));
        assert!(parse_args(&argv(&["rust-mediafusion", "layout", "--resolution", "1080p"])).is_err());
        assert!(parse_args(&argv(&["rust-mediafusion", "live", "--method", "edges"])).is_err());
        assert!(parse_args(&argv(&["rust-mediafusion", "scan"])).unwrap_err().starts_with("Unknown command"));
    }
}
