pub fn print_startup_banner(session_name: &str) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;72m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                    _     __
  ____ ___________(_)__ / /_ ___ _
 / __ `/ ___/ ___/ (_-</ __// _ `/
/ /_/ (__  |__  ) /___/\__/ \_, /
\__,_/____/____/_/           /_/   "#;
    const APP_DESCRIPTION: &str =
        "Assistance dispatch queue: requesters line up, helpers take the oldest.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("ASSISTQ_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("Session: {session_name}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
