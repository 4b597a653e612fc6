//! Build script for mpcomm.
//!
//! The thread backend needs nothing from here. With the `native` feature the
//! script locates an MPI installation, compiles `csrc/mpcomm.c` against it and
//! emits the link flags. Probes run in order and the first hit wins:
//!
//! | Probe | Driven by |
//! |-------|-----------|
//! | prefix override | `MPCOMM_MPI_DIR` |
//! | pkg-config | `MPI_PKG_CONFIG`, then `mpich`, `ompi`, `mpi` |
//! | compiler wrapper | `MPICC` (default `mpicc`), `-show` or `--showme` |
//! | Cray | `CRAY_MPICH_DIR` |
//! | well-known prefixes | `/usr`, `/usr/local`, `/opt/mpich`, `/opt/openmpi` |

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const WATCHED_VARS: &[&str] = &["MPCOMM_MPI_DIR", "MPI_PKG_CONFIG", "MPICC", "CRAY_MPICH_DIR"];

fn main() {
    println!("cargo:rerun-if-changed=csrc/mpcomm.c");
    println!("cargo:rerun-if-changed=csrc/mpcomm.h");
    for var in WATCHED_VARS {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }

    let install = locate_mpi().unwrap_or_else(|| {
        panic!(
            "the `native` feature needs an MPI installation (MPICH or Open MPI); \
             set MPCOMM_MPI_DIR or MPI_PKG_CONFIG, put mpicc on PATH, \
             or build without `--features native` to use the thread backend only"
        )
    });
    eprintln!("mpcomm: using MPI from {}", install.origin);

    compile_shim(&install);
    install.emit_link_flags();
}

/// Where MPI was found and what it takes to build against it.
struct MpiInstall {
    origin: String,
    include_paths: Vec<PathBuf>,
    link_paths: Vec<PathBuf>,
    libs: Vec<String>,
}

impl MpiInstall {
    /// Install rooted at `prefix`, if it ships `include/mpi.h`.
    fn at_prefix(prefix: &Path, origin: String) -> Option<Self> {
        let include = prefix.join("include");
        if !include.join("mpi.h").exists() {
            return None;
        }
        let link_paths = ["lib", "lib64", "lib/x86_64-linux-gnu"]
            .iter()
            .map(|dir| prefix.join(dir))
            .filter(|dir| dir.is_dir())
            .collect();
        Some(MpiInstall {
            origin,
            include_paths: vec![include],
            link_paths,
            libs: vec!["mpi".to_string()],
        })
    }

    fn emit_link_flags(&self) {
        for path in &self.link_paths {
            println!("cargo:rustc-link-search=native={}", path.display());
            // Pick up the same libmpi at run time as at link time.
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", path.display());
        }
        for lib in &self.libs {
            println!("cargo:rustc-link-lib={lib}");
        }
    }
}

fn compile_shim(install: &MpiInstall) {
    let mut build = cc::Build::new();
    build
        .file("csrc/mpcomm.c")
        .include("csrc")
        .includes(&install.include_paths)
        .warnings(true)
        .extra_warnings(true);
    if env::var("PROFILE").as_deref() == Ok("release") {
        build.opt_level(3);
    }
    build.compile("mpcomm");
}

fn locate_mpi() -> Option<MpiInstall> {
    from_prefix_override()
        .or_else(from_pkg_config)
        .or_else(from_wrapper)
        .or_else(from_cray)
        .or_else(from_known_prefixes)
}

fn from_prefix_override() -> Option<MpiInstall> {
    let dir = PathBuf::from(env::var_os("MPCOMM_MPI_DIR")?);
    let origin = format!("MPCOMM_MPI_DIR={}", dir.display());
    MpiInstall::at_prefix(&dir, origin)
}

fn from_pkg_config() -> Option<MpiInstall> {
    let requested = env::var("MPI_PKG_CONFIG").ok();
    let found = requested
        .iter()
        .map(String::as_str)
        .chain(["mpich", "ompi", "mpi"])
        .find_map(|name| {
            let lib = pkg_config::Config::new().cargo_metadata(false).probe(name).ok()?;
            Some(MpiInstall {
                origin: format!("pkg-config {name} {}", lib.version),
                include_paths: lib.include_paths,
                link_paths: lib.link_paths,
                libs: lib.libs,
            })
        });
    found
}

/// Ask the compiler wrapper for its flags: MPICH answers `-show`, Open MPI
/// `--showme`.
fn from_wrapper() -> Option<MpiInstall> {
    let wrapper = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());
    ["-show", "--showme"].iter().find_map(|flag| {
        let output = Command::new(&wrapper).arg(flag).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let line = String::from_utf8_lossy(&output.stdout);
        Some(parse_wrapper_flags(&line, format!("{wrapper} {flag}")))
    })
}

fn parse_wrapper_flags(line: &str, origin: String) -> MpiInstall {
    let mut install = MpiInstall {
        origin,
        include_paths: Vec::new(),
        link_paths: Vec::new(),
        libs: Vec::new(),
    };
    for word in line.split_whitespace() {
        if let Some(path) = word.strip_prefix("-I") {
            install.include_paths.push(PathBuf::from(path));
        } else if let Some(path) = word.strip_prefix("-L") {
            install.link_paths.push(PathBuf::from(path));
        } else if let Some(lib) = word.strip_prefix("-l") {
            install.libs.push(lib.to_string());
        } else if let Some(path) = word.strip_prefix("-Wl,-rpath,") {
            let path = PathBuf::from(path);
            if !install.link_paths.contains(&path) {
                install.link_paths.push(path);
            }
        }
    }
    if install.libs.is_empty() {
        install.libs.push("mpi".to_string());
    }
    install
}

fn from_cray() -> Option<MpiInstall> {
    let dir = PathBuf::from(env::var_os("CRAY_MPICH_DIR")?);
    let origin = format!("CRAY_MPICH_DIR={}", dir.display());
    MpiInstall::at_prefix(&dir, origin)
}

fn from_known_prefixes() -> Option<MpiInstall> {
    ["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi"]
        .iter()
        .find_map(|prefix| MpiInstall::at_prefix(Path::new(prefix), format!("prefix {prefix}")))
}
