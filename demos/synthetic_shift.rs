// demos/synthetic_shift.rs -- Run a whole DIC task on a synthetic sequence.
//
//   cargo run --release --example synthetic_shift
//   cargo run --release --example synthetic_shift -- --gpu
//   cargo run --release --example synthetic_shift -- params.json
//
// Builds a speckle pattern moving by (0.8, -0.4) px per frame with a slight
// horizontal stretch, correlates every consecutive pair and prints the
// direct and cumulative displacement and strain at the image centre.
// A JSON argument is parsed as `TaskParameters` and replaces the defaults
// below. Set RUST_LOG=info (or debug) to follow the engine.

use std::sync::Arc;
use std::thread;

use dicer::config::TaskParameters;
use dicer::engine::{Engine, Phase};
use dicer::gpu::correlation::GpuKernelProgram;
use dicer::gpu::device::GpuDevice;
use dicer::image::Image;
use dicer::kernel::cpu::CpuKernelProgram;
use dicer::kernel::KernelProgram;
use dicer::roi::Roi;
use dicer::task::container::TaskContainer;

const WIDTH: usize = 240;
const HEIGHT: usize = 180;
const FRAMES: usize = 5;
const STEP: (f32, f32) = (0.8, -0.4);
const STRETCH: f32 = 0.004;

fn speckle(frame: usize) -> Image<f32> {
    let t = frame as f32;
    let cx = WIDTH as f32 / 2.0;
    Image::from_fn(WIDTH, HEIGHT, |x, y| {
        // Material point currently at x came from x0 with x = x0 + s(x0 - cx) + d.
        let x = cx + (x as f32 - cx - STEP.0 * t) / (1.0 + STRETCH * t);
        let y = y as f32 - STEP.1 * t;
        128.0 + 45.0 * (0.57 * x).sin() * (0.41 * y).cos() + 30.0 * (0.19 * x + 0.83 * y).sin()
    })
}

fn default_params() -> TaskParameters {
    TaskParameters {
        facet_size: Some(15),
        facet_spacing: Some(4),
        deformation_limits: Some(vec![-2.0, 2.0, 0.5, -2.0, 2.0, 0.5]),
        fine_search: Some(true),
        strain_window_mm: Some(15.0),
        ..Default::default()
    }
}

fn run<K: KernelProgram>(mut engine: Engine<K>, container: Arc<TaskContainer>) -> dicer::error::Result<()> {
    let rx = engine.subscribe();
    let printer = thread::spawn(move || {
        for event in rx {
            match event.phase {
                Phase::RoundFinished { elapsed } => {
                    println!("round {} finished in {:.1} ms", event.round, elapsed.as_secs_f64() * 1e3);
                }
                Phase::Finished => println!("task finished"),
                _ => {}
            }
        }
    });

    let status = engine.compute_task(&container)?;
    drop(engine);
    let _ = printer.join();

    let (cx, cy) = (WIDTH / 2, HEIGHT / 2);
    for key in container.result_keys() {
        let Some(result) = container.result(key.0, key.1) else { continue };
        let d = result.displacement.as_ref().and_then(|d| d.get(cx, cy));
        let s = result.strain.as_ref().and_then(|s| s.get(cx, cy));
        println!("{:>2} -> {:<2} u,v = {:<24} strain = {:?}", key.0, key.1, format!("{d:.3?}"), s);
    }
    println!("complete: {}", status.complete);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let use_gpu = args.iter().any(|a| a == "--gpu");
    let params = match args.iter().find(|a| a.ends_with(".json")) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => default_params(),
    };

    let images = (0..FRAMES).map(speckle).collect();
    let mut container = TaskContainer::new(images, params);
    for round in 0..FRAMES - 1 {
        container.add_roi(round, Roi::Rectangle { x1: 20, y1: 20, x2: WIDTH as i64 - 21, y2: HEIGHT as i64 - 21 });
    }
    let container = Arc::new(container);

    if use_gpu {
        let gpu = Arc::new(GpuDevice::new()?);
        println!("GPU: {} [{}]", gpu.adapter_info, gpu.profile);
        run(Engine::new(GpuKernelProgram::new(gpu))?, container)?;
    } else {
        run(Engine::new(CpuKernelProgram::new())?, container)?;
    }
    Ok(())
}
