//! `mpmrun N program [args…]`: spawn a process group wired for mpm.

use std::env;
use std::process::exit;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: mpmrun N program [args...]");
        exit(2);
    }
    let world: usize = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("mpmrun: world size must be a decimal integer, got {:?}", args[1]);
            exit(2);
        }
    };

    match mpm::launcher::run(world, &args[2], &args[3..]) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("mpmrun: {e}");
            exit(1);
        }
    }
}
