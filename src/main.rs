use std::process::ExitCode;

fn main() -> ExitCode {
    art_optimizer_lib::run()
}
