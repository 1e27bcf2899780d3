use histostack::cache::CacheLimits;
use histostack::engine::params::{MetricKind, PerLevel, RegistrationParams, RigidSearch};
use histostack::project::DEFAULT_IMAGE_EXT;
use histostack::{ReconOptions, ReferenceEngine, RefineOptions, StackProject, VolMatchOptions};
use std::env;
use std::path::PathBuf;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let program = env::args().next().unwrap_or_else(|| "histostack".to_string());
    let mut args: Vec<String> = env::args().skip(1).collect();

    // Global flags come before the command.
    let mut reuse = false;
    while args.first().map(|a| a.as_str()) == Some("-N") {
        reuse = true;
        args.remove(0);
    }

    if args.is_empty() {
        return Err(usage(&program));
    }
    let command = args.remove(0);
    if command == "help" || command == "--help" || command == "-h" {
        println!("{}", usage(&program));
        return Ok(());
    }

    // Every command ends with the project directory.
    let project_dir = PathBuf::from(
        args.pop()
            .ok_or_else(|| format!("missing project directory\n{}", usage(&program)))?,
    );

    match command.as_str() {
        "init" => init(&program, args, &project_dir, reuse),
        "recon" => recon(&program, args, &project_dir, reuse),
        "volmatch" => volmatch(&program, args, &project_dir, reuse),
        "voliter" => voliter(&program, args, &project_dir, reuse),
        other => Err(format!("unknown command '{other}'\n{}", usage(&program))),
    }
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [-N] <command> [options] <project_dir>\n\n\
Commands:\n  \
init      -M <manifest> [-ext <ext>]        create a project from a manifest\n  \
recon     -z <z_range> <z_epsilon>          reconstruct the stack\n  \
volmatch  -i <volume>                       initial match to the volume\n  \
voliter   [-na N] [-nd N] [-R a b] [-w W]   iterative refinement\n            \
[-seed S]\n\n\
Engine passthrough (recon, volmatch, voliter):\n  \
-m <ncc|ssd> [radius]   similarity metric\n  \
-n <iters>              iterations per level, e.g. 100x50x10\n  \
-threads <n>            engine worker count\n  \
-search <iters> <angle> <xyz>   randomized rigid search before optimization\n\n\
Global flags:\n  \
-N    reuse mode: skip any work whose output file already exists\n"
    )
}

/// Engine flags shared by the registration-running commands.
struct EngineFlags {
    base: RegistrationParams,
    threads: usize,
}

impl EngineFlags {
    fn new() -> Self {
        Self {
            base: RegistrationParams::default(),
            threads: 0,
        }
    }

    /// Consume one recognized flag; `Ok(false)` when the flag is not ours.
    fn try_parse(
        &mut self,
        arg: &str,
        args: &mut std::iter::Peekable<std::vec::IntoIter<String>>,
    ) -> Result<bool, String> {
        match arg {
            "-m" => {
                let kind = args.next().ok_or("-m expects a metric name")?;
                self.base.metric = match kind.to_lowercase().as_str() {
                    "ncc" => {
                        let radius = match args.peek().and_then(|v| v.parse::<u32>().ok()) {
                            Some(r) => {
                                args.next();
                                r
                            }
                            None => 4,
                        };
                        MetricKind::Ncc { radius }
                    }
                    "ssd" => MetricKind::Ssd,
                    other => return Err(format!("unknown metric '{other}'. Use ncc|ssd.")),
                };
                Ok(true)
            }
            "-n" => {
                let spec = args.next().ok_or("-n expects an iteration spec")?;
                let levels: Result<Vec<u32>, _> =
                    spec.split('x').map(|tok| tok.parse::<u32>()).collect();
                let levels = levels.map_err(|_| format!("bad iteration spec '{spec}'"))?;
                self.base.iterations = if levels.len() == 1 {
                    PerLevel::Uniform(levels[0])
                } else {
                    PerLevel::Schedule(levels)
                };
                Ok(true)
            }
            "-threads" => {
                let value = args.next().ok_or("-threads expects a count")?;
                self.threads = value
                    .parse()
                    .map_err(|_| format!("bad thread count '{value}'"))?;
                Ok(true)
            }
            "-search" => {
                let iters = args.next().ok_or("-search expects <iters> <angle> <xyz>")?;
                let angle = args.next().ok_or("-search expects <iters> <angle> <xyz>")?;
                let xyz = args.next().ok_or("-search expects <iters> <angle> <xyz>")?;
                self.base.rigid_search = Some(RigidSearch {
                    iterations: iters
                        .parse()
                        .map_err(|_| format!("bad search iterations '{iters}'"))?,
                    sigma_angle_deg: angle
                        .parse()
                        .map_err(|_| format!("bad search angle '{angle}'"))?,
                    sigma_xyz: xyz.parse().map_err(|_| format!("bad search sigma '{xyz}'"))?,
                });
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn init(program: &str, args: Vec<String>, project_dir: &PathBuf, reuse: bool) -> Result<(), String> {
    let mut manifest: Option<PathBuf> = None;
    let mut ext = DEFAULT_IMAGE_EXT.to_string();

    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-M" => manifest = Some(PathBuf::from(args.next().ok_or("-M expects a filename")?)),
            "-ext" => ext = args.next().ok_or("-ext expects an extension")?,
            other => return Err(format!("unknown option '{other}' to 'init'\n{}", usage(program))),
        }
    }
    let manifest = manifest.ok_or("missing manifest file (-M) in 'init'")?;
    StackProject::initialize(project_dir, &manifest, ext, reuse).map_err(|e| e.to_string())?;
    Ok(())
}

fn recon(program: &str, args: Vec<String>, project_dir: &PathBuf, reuse: bool) -> Result<(), String> {
    let mut flags = EngineFlags::new();
    let mut z_range: Option<f64> = None;
    let mut z_epsilon = 0.1;

    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        if flags.try_parse(&arg, &mut args)? {
            continue;
        }
        match arg.as_str() {
            "-z" => {
                let range = args.next().ok_or("-z expects <z_range> <z_epsilon>")?;
                let eps = args.next().ok_or("-z expects <z_range> <z_epsilon>")?;
                z_range = Some(range.parse().map_err(|_| format!("bad z_range '{range}'"))?);
                z_epsilon = eps.parse().map_err(|_| format!("bad z_epsilon '{eps}'"))?;
            }
            other => {
                return Err(format!("unknown option '{other}' to 'recon'\n{}", usage(program)))
            }
        }
    }

    let project = StackProject::restore(project_dir, reuse).map_err(|e| e.to_string())?;
    let opts = ReconOptions {
        z_range: z_range.ok_or("missing z parameters (-z) in 'recon'")?,
        z_epsilon,
        threads: flags.threads,
        cache: CacheLimits::default(),
        base: flags.base,
        ..ReconOptions::default()
    };
    let mut engine = ReferenceEngine::new();
    let summary = project
        .reconstruct(&mut engine, &opts)
        .map_err(|e| e.to_string())?;
    println!(
        "reconstructed around root slide {}",
        project.slide(summary.root).unique_id
    );
    Ok(())
}

fn volmatch(
    program: &str,
    args: Vec<String>,
    project_dir: &PathBuf,
    reuse: bool,
) -> Result<(), String> {
    let mut flags = EngineFlags::new();
    let mut volume: Option<PathBuf> = None;

    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        if flags.try_parse(&arg, &mut args)? {
            continue;
        }
        match arg.as_str() {
            "-i" => volume = Some(PathBuf::from(args.next().ok_or("-i expects a filename")?)),
            other => {
                return Err(format!(
                    "unknown option '{other}' to 'volmatch'\n{}",
                    usage(program)
                ))
            }
        }
    }
    let volume = volume.ok_or("missing volume file (-i) in 'volmatch'")?;

    let project = StackProject::restore(project_dir, reuse).map_err(|e| e.to_string())?;
    let opts = VolMatchOptions {
        threads: flags.threads,
        base: flags.base,
    };
    let mut engine = ReferenceEngine::new();
    project
        .match_to_volume(&mut engine, &volume, &opts)
        .map_err(|e| e.to_string())
}

fn voliter(
    program: &str,
    args: Vec<String>,
    project_dir: &PathBuf,
    reuse: bool,
) -> Result<(), String> {
    let mut flags = EngineFlags::new();
    let mut opts = RefineOptions::default();

    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        if flags.try_parse(&arg, &mut args)? {
            continue;
        }
        match arg.as_str() {
            "-na" => {
                let value = args.next().ok_or("-na expects a count")?;
                opts.n_affine = value.parse().map_err(|_| format!("bad count '{value}'"))?;
            }
            "-nd" => {
                let value = args.next().ok_or("-nd expects a count")?;
                opts.n_deform = value.parse().map_err(|_| format!("bad count '{value}'"))?;
            }
            "-R" => {
                let first = args.next().ok_or("-R expects <first> <last>")?;
                let last = args.next().ok_or("-R expects <first> <last>")?;
                opts.range = Some((
                    first.parse().map_err(|_| format!("bad iteration '{first}'"))?,
                    last.parse().map_err(|_| format!("bad iteration '{last}'"))?,
                ));
            }
            "-w" => {
                let value = args.next().ok_or("-w expects a weight")?;
                opts.w_volume = value.parse().map_err(|_| format!("bad weight '{value}'"))?;
            }
            "-seed" => {
                let value = args.next().ok_or("-seed expects an integer")?;
                opts.seed = Some(value.parse().map_err(|_| format!("bad seed '{value}'"))?);
            }
            other => {
                return Err(format!(
                    "unknown option '{other}' to 'voliter'\n{}",
                    usage(program)
                ))
            }
        }
    }

    opts.threads = flags.threads;
    opts.base = flags.base;

    let project = StackProject::restore(project_dir, reuse).map_err(|e| e.to_string())?;
    let mut engine = ReferenceEngine::new();
    project
        .refine_to_volume(&mut engine, &opts)
        .map_err(|e| e.to_string())
}
