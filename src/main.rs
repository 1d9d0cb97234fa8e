//! Recognise the mathematical expression in a PGM image.
//!
//! Prints the sample's connected components, then the most probable
//! derivation: the rules used, its glyphs and the LaTeX output.

use clap::Parser;
use formula_cyk::{Bitmap, Grammar, ParserConfig};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The grammar file.
    grammar: std::path::PathBuf,

    /// The input image (binary or ASCII PGM).
    image: std::path::PathBuf,

    /// Minimum relation score for two hypotheses to combine.
    #[arg(long, default_value_t = 0.45)]
    fusion_threshold: f64,

    /// Penalize subscripts taller than their base, as superscripts are.
    #[arg(long)]
    penalize_subscript_height: bool,

    /// Print the number of hypotheses generated per span. Off by default;
    /// without it only the sample and the recognition are printed.
    #[arg(long)]
    stats: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = ParserConfig {
        fusion_threshold: args.fusion_threshold,
        penalize_subscript_height: args.penalize_subscript_height,
        ..Default::default()
    };

    let grammar = match Grammar::load(&args.grammar) {
        Ok(grammar) => grammar.with_config(config),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let sample = match Bitmap::open(&args.image) {
        Ok(sample) => sample,
        Err(e) => {
            eprintln!("{}: {e}", args.image.display());
            std::process::exit(1);
        }
    };

    println!("{sample}");
    let recognition = grammar.parse(&sample);
    if args.stats {
        println!("{}\n", recognition.stats);
    }
    println!("{recognition}");
}
