//! Prism model viewer
//!
//! Loads Wavefront OBJ models and renders them through the mesh shading
//! pipeline.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p prism-viewer -- --model assets/bunny.obj --texture assets/bunny.png
//! ```
//!
//! The GLSL sources under `shaders/` must be compiled to SPIR-V first:
//!
//! ```bash
//! for stage in task mesh frag; do
//!     glslangValidator -V --target-env vulkan1.3 shaders/meshlet.$stage -o shaders/meshlet.$stage.spv
//! done
//! ```
//!
//! ## Controls
//!
//! Hold the right mouse button to look around and fly with WASD, Q/E and
//! Space. The scroll wheel moves along the view direction.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;

use glam::Vec3;
use prism_app::{run_app, AppConfig, PrismApp, RenderContext, Transform};
use tracing::{error, info};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Distance between models placed side by side.
const MODEL_SPACING: f32 = 2.5;

/// A model and its optional texture.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelArg {
    model: PathBuf,
    texture: Option<PathBuf>,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct ViewerArgs {
    models: Vec<ModelArg>,
    shader_dir: Option<PathBuf>,
    vsync: bool,
    validation: bool,
    help: bool,
}

impl ViewerArgs {
    fn from_env() -> Result<Self, String> {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse arguments, program name excluded. `--texture` applies to the
    /// preceding `--model`.
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => parsed.help = true,
                "--vsync" => parsed.vsync = true,
                "--validation" => parsed.validation = true,
                "--model" => {
                    let path = args.next().ok_or("--model requires a path")?;
                    parsed.models.push(ModelArg {
                        model: PathBuf::from(path),
                        texture: None,
                    });
                }
                "--texture" => {
                    let path = args.next().ok_or("--texture requires a path")?;
                    let model = parsed
                        .models
                        .last_mut()
                        .ok_or("--texture must follow a --model")?;
                    model.texture = Some(PathBuf::from(path));
                }
                "--shaders" => {
                    let path = args.next().ok_or("--shaders requires a directory")?;
                    parsed.shader_dir = Some(PathBuf::from(path));
                }
                other => return Err(format!("Unknown argument: {other}")),
            }
        }

        Ok(parsed)
    }
}

/// X offset of the `index`-th of `count` models, centred on the origin.
fn model_offset(index: usize, count: usize) -> f32 {
    (index as f32 - (count.saturating_sub(1)) as f32 / 2.0) * MODEL_SPACING
}

struct Viewer;

impl PrismApp for Viewer {
    fn init(ctx: &mut RenderContext) -> anyhow::Result<Self> {
        let args = ViewerArgs::from_env().map_err(anyhow::Error::msg)?;
        let count = args.models.len();
        if count == 0 {
            info!("No models given; pass --model <path> to load one");
        }

        for (index, arg) in args.models.iter().enumerate() {
            match ctx.load_object(&arg.model, arg.texture.as_deref()) {
                Ok(id) => {
                    ctx.set_transform(
                        id,
                        Transform {
                            position: Vec3::new(model_offset(index, count), 0.0, 0.0),
                            ..Default::default()
                        },
                    )?;
                    info!(
                        "Object {id}: {} ({} indices)",
                        arg.model.display(),
                        ctx.indices_count(id)
                    );
                }
                Err(e) => error!("Failed to load {}: {e:#}", arg.model.display()),
            }
        }

        Ok(Self)
    }
}

fn main() -> anyhow::Result<()> {
    let args = match ViewerArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}\n");
            print_help();
            std::process::exit(2);
        }
    };
    if args.help {
        print_help();
        return Ok(());
    }

    let mut config = AppConfig::new("Prism Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_vsync(args.vsync);
    if args.validation {
        config = config.with_validation(true);
    }
    if let Some(dir) = args.shader_dir {
        config = config.with_shader_dir(dir);
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Prism Viewer

USAGE:
    cargo run -p prism-viewer -- [OPTIONS]

OPTIONS:
    --model <PATH>      OBJ model to load (repeatable)
    --texture <PATH>    Texture for the preceding model
                        Missing or unreadable textures fall back to white
    --shaders <DIR>     Directory with meshlet.task.spv, meshlet.mesh.spv
                        and meshlet.frag.spv (default: shaders)
    --vsync             Present with FIFO instead of mailbox
    --validation        Enable Vulkan validation layers
    -h, --help          Print this help message

CONTROLS:
    Right mouse         Hold to look around and move
    W/A/S/D             Move forward/left/back/right
    E, Space / Q        Move up / down
    Scroll              Move along the view direction

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ViewerArgs, String> {
        ViewerArgs::parse(args.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn textures_attach_to_preceding_model() {
        let args = parse(&[
            "--model", "a.obj", "--texture", "a.png", "--model", "b.obj", "--vsync",
        ])
        .unwrap();
        assert_eq!(args.models.len(), 2);
        assert_eq!(args.models[0].texture, Some(PathBuf::from("a.png")));
        assert_eq!(args.models[1].texture, None);
        assert!(args.vsync);
        assert!(!args.validation);
    }

    #[test]
    fn invalid_arguments() {
        assert!(parse(&["--texture", "a.png"]).is_err());
        assert!(parse(&["--model"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["-h"]).unwrap().help);
    }

    #[test]
    fn models_are_centred() {
        assert!(model_offset(0, 1).abs() < f32::EPSILON);
        assert!((model_offset(0, 2) + MODEL_SPACING / 2.0).abs() < f32::EPSILON);
        assert!((model_offset(1, 2) - MODEL_SPACING / 2.0).abs() < f32::EPSILON);
    }
}
