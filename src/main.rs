use std::{path::PathBuf, time::Instant};

use ocrpatch::{Candidate, PatchEngineBuilder, PatchOptions, StyleOptions};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

fn parse_quad(arg: &str) -> [[i32; 2]; 4] {
    let coords = arg
        .split(',')
        .map(|it| it.trim().parse::<i32>().expect("Quad coordinates must be integers"))
        .collect::<Vec<_>>();
    assert_eq!(coords.len(), 8, "Expected x1,y1,x2,y2,x3,y3,x4,y4");
    [0, 1, 2, 3].map(|i| [coords[2 * i], coords[2 * i + 1]])
}

fn main() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(image_path), Some(quad)) = (args.next(), args.next()) else {
        eprintln!("usage: ocrpatch <image> <x1,y1,x2,y2,x3,y3,x4,y4> [out.png]");
        std::process::exit(2);
    };
    let out = args.next().map_or_else(|| PathBuf::from("patch.png"), PathBuf::from);

    let bytes = std::fs::read(&image_path).expect("Failed to read image");
    let candidate = Candidate::new(parse_quad(&quad));
    let engine = PatchEngineBuilder::new().build();

    let start = Instant::now();
    let result = engine.generate_patch(&bytes, &candidate, &PatchOptions::default());
    log::debug!("{:?}", start.elapsed());
    println!(
        "{}",
        serde_json::to_string_pretty(&result.debug_info).expect("Failed to serialize debug info")
    );

    match result.image_bytes {
        Some(png) => {
            std::fs::write(&out, png).expect("Failed to write patch");
            println!("patch at {:?} written to {}", result.bbox, out.display());
        }
        None => {
            eprintln!("{}", result.error_message().unwrap_or_default());
            std::process::exit(1);
        }
    }

    let image = image::load_from_memory(&bytes)
        .expect("Failed to load image")
        .to_rgb8();
    let style = engine
        .estimate_style(&image, &candidate, &StyleOptions::default())
        .expect("Failed to estimate style");
    println!(
        "{}",
        serde_json::to_string_pretty(&style).expect("Failed to serialize style")
    );
}
