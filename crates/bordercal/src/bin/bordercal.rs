use std::error::Error;
use std::path::PathBuf;

use bordercal::optim::SolverOptions;
use bordercal::{io, pipeline};
use bordercal::{
    BoardModel, BoardSpec, DictionaryId, DistortionFit, IntrinsicOptions, PinholeIntrinsics,
    PoseOptions,
};
use clap::{Args, Parser, Subcommand, ValueEnum};

/// Calibrate a camera against a border-only marker board.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Estimate K and distortion from a folder of board images.
    CalibrateIntrinsics {
        /// Folder of images with detection sidecars (`<image>.json`).
        #[arg(long)]
        images: PathBuf,

        #[command(flatten)]
        board: BoardArgs,

        /// Image size as `WIDTHxHEIGHT`; read from the sidecars when omitted.
        #[arg(long, value_parser = parse_image_size)]
        image_size: Option<[u32; 2]>,

        /// Distortion terms to estimate.
        #[arg(long, value_enum, default_value_t = DistortionArg::Full)]
        distortion: DistortionArg,

        #[arg(long, default_value_t = 200)]
        max_iterations: usize,

        /// Intrinsics JSON to write.
        #[arg(long, default_value = "intrinsics.json")]
        output: PathBuf,
    },

    /// Estimate the board pose in every image of a folder.
    CalibrateExtrinsics {
        #[arg(long)]
        images: PathBuf,

        /// Intrinsics JSON from `calibrate-intrinsics`.
        #[arg(long)]
        intrinsics: PathBuf,

        #[command(flatten)]
        board: BoardArgs,

        /// Fewest board markers per image for a pose.
        #[arg(long, default_value_t = 2)]
        min_markers: usize,

        /// Batch pose JSON to write.
        #[arg(long, default_value = "poses.json")]
        output: PathBuf,
    },

    /// Split a batch pose JSON into one 4x4 text file per image.
    ExportPoses {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output_dir: PathBuf,
    },
}

#[derive(Debug, Args)]
struct BoardArgs {
    /// Markers along the board width.
    #[arg(long, default_value_t = 5)]
    markers_x: u32,

    /// Markers along the board height.
    #[arg(long, default_value_t = 7)]
    markers_y: u32,

    /// Marker side length (output translation unit).
    #[arg(long)]
    marker_length: f64,

    /// Gap between neighbouring markers, same unit as the length.
    #[arg(long)]
    marker_sep: f64,

    /// Marker dictionary, e.g. `DICT_6X6_250`.
    #[arg(long, default_value = "DICT_6X6_250")]
    dict: DictionaryId,
}

impl BoardArgs {
    fn board(&self) -> Result<BoardModel, Box<dyn Error>> {
        Ok(BoardModel::new(BoardSpec {
            markers_x: self.markers_x,
            markers_y: self.markers_y,
            marker_length: self.marker_length,
            marker_separation: self.marker_sep,
            dictionary: self.dict,
        })?)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DistortionArg {
    None,
    Radial,
    RadialTangential,
    Full,
}

impl From<DistortionArg> for DistortionFit {
    fn from(arg: DistortionArg) -> Self {
        match arg {
            DistortionArg::None => DistortionFit::None,
            DistortionArg::Radial => DistortionFit::Radial,
            DistortionArg::RadialTangential => DistortionFit::RadialTangential,
            DistortionArg::Full => DistortionFit::Full,
        }
    }
}

fn parse_image_size(s: &str) -> Result<[u32; 2], String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let w: u32 = w.trim().parse().map_err(|e| format!("width: {e}"))?;
    let h: u32 = h.trim().parse().map_err(|e| format!("height: {e}"))?;
    Ok([w, h])
}

fn init_logging(verbose: u8) -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "tracing")]
    {
        let _ = verbose;
        bordercal::core::init_tracing(false);
        let _ = tracing_log::LogTracer::init();
        Ok(())
    }
    #[cfg(not(feature = "tracing"))]
    {
        bordercal::core::init_with_verbosity(verbose)?;
        Ok(())
    }
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Command::CalibrateIntrinsics {
            images,
            board,
            image_size,
            distortion,
            max_iterations,
            output,
        } => {
            let board = board.board()?;
            let options = IntrinsicOptions {
                distortion: distortion.into(),
                solver: SolverOptions {
                    max_iterations,
                    ..SolverOptions::default()
                },
            };
            let result =
                pipeline::calibrate_intrinsics_folder(&board, &images, image_size, options)?;
            io::write_intrinsics(&result, &output)?;

            let k = PinholeIntrinsics::from_k_matrix(&result.camera_matrix);
            println!("RMS reprojection error: {:.6} px", result.rms_error);
            println!("views used: {}", result.views.len());
            println!("K:");
            for r in 0..3 {
                let m = &result.camera_matrix;
                println!("  {:14.6} {:14.6} {:14.6}", m[(r, 0)], m[(r, 1)], m[(r, 2)]);
            }
            println!("fx={:.4} fy={:.4} cx={:.4} cy={:.4}", k.fx, k.fy, k.cx, k.cy);
            println!("dist (k1 k2 p1 p2 k3): {:?}", result.distortion);
            println!("wrote {}", output.display());
        }
        Command::CalibrateExtrinsics {
            images,
            intrinsics,
            board,
            min_markers,
            output,
        } => {
            let board = board.board()?;
            let calib = io::read_intrinsics(&intrinsics)?;
            let options = PoseOptions {
                min_markers,
                ..PoseOptions::default()
            };
            let records = pipeline::estimate_extrinsics_folder(&board, &images, &calib, options)?;
            let rejected = io::write_batch(&records, &output)?;
            println!(
                "{} poses written to {}",
                records.len() - rejected.len(),
                output.display()
            );
        }
        Command::ExportPoses { input, output_dir } => {
            let records = io::read_batch(&input)?;
            let written = io::export_batch_to_dir(&records, &output_dir)?;
            println!("{} pose files written to {}", written.len(), output_dir.display());
        }
    }
    Ok(())
}
