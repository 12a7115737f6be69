// Drive the SpringBoard shim: icons, wallpapers and orientation

use clap::{Arg, Command};
use springboard_remote::{
    pretty_print_dictionary,
    springboard::{SpringBoardServiceClient, WallpaperName},
};
use tracing::info;

mod common;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = common::connection_args(
        Command::new("springboard").about("Interact with the SpringBoard shim service"),
    )
    .subcommand(
        Command::new("icon_state").about("Gets the icon state").arg(
            Arg::new("save")
                .long("save")
                .value_name("PATH")
                .help("Path to save the icon state plist to"),
        ),
    )
    .subcommand(
        Command::new("set_icon_state")
            .about("Sets the icon state from an array plist")
            .arg(Arg::new("path").required(true).index(1)),
    )
    .subcommand(
        Command::new("icon")
            .about("Gets the PNG icon of an app")
            .arg(Arg::new("bundle_id").required(true).index(1))
            .arg(Arg::new("save").required(true).index(2)),
    )
    .subcommand(
        Command::new("wallpaper_info")
            .about("Gets wallpaper metadata")
            .arg(Arg::new("name").required(true).index(1)),
    )
    .subcommand(
        Command::new("wallpaper_preview")
            .about("Gets a wallpaper preview")
            .arg(
                Arg::new("name")
                    .required(true)
                    .index(1)
                    .value_parser(["homescreen", "lockscreen"]),
            )
            .arg(
                Arg::new("save")
                    .long("save")
                    .value_name("PATH")
                    .default_value("preview.png"),
            ),
    )
    .subcommand(
        Command::new("wallpaper")
            .about("Gets the full wallpaper image")
            .arg(Arg::new("name").required(true).index(1))
            .arg(
                Arg::new("save")
                    .long("save")
                    .value_name("PATH")
                    .default_value("wallpaper.png"),
            ),
    )
    .subcommand(Command::new("icon_metrics").about("Gets home screen icon metrics"))
    .subcommand(Command::new("orientation").about("Gets the interface orientation"))
    .get_matches();

    if matches.get_flag("about") {
        println!("springboard - drive the SpringBoard shim service");
        println!("Set RUST_LOG=debug to see the exchanged plists.");
        return;
    }

    let provider = match common::get_provider(&matches, "springboard-tools") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let client = SpringBoardServiceClient::with_provider(provider);
    info!("Using shim at {}", client.address());

    match matches.subcommand() {
        Some(("icon_state", sub)) => {
            let state = client
                .get_icon_state()
                .await
                .expect("Failed to get icon state");
            println!("{}", pretty_print_dictionary(&state));
            if let Some(path) = sub.get_one::<String>("save") {
                plist::to_file_xml(path, &state).expect("Failed to save icon state");
            }
        }
        Some(("set_icon_state", sub)) => {
            let path = sub.get_one::<String>("path").expect("No path passed");
            let state: Vec<plist::Dictionary> =
                plist::from_file(path).expect("Failed to read icon state plist");
            client
                .set_icon_state(state)
                .await
                .expect("Failed to set icon state");
            println!("Icon state set");
        }
        Some(("icon", sub)) => {
            let bundle_id = sub.get_one::<String>("bundle_id").expect("No bundle ID");
            let save = sub.get_one::<String>("save").expect("No save path");
            match client
                .get_icon_pngdata(bundle_id.as_str())
                .await
                .expect("Failed to get icon")
            {
                Some(png) => tokio::fs::write(save, png).await.expect("Failed to save icon"),
                None => eprintln!("Device returned no icon data for {bundle_id}"),
            }
        }
        Some(("wallpaper_info", sub)) => {
            let name = sub.get_one::<String>("name").expect("No name");
            let info = client
                .get_wallpaper_info(name.as_str())
                .await
                .expect("Failed to get wallpaper info");
            println!("{}", pretty_print_dictionary(&info));
        }
        Some(("wallpaper_preview", sub)) => {
            let name: WallpaperName = sub
                .get_one::<String>("name")
                .expect("No name")
                .parse()
                .expect("Invalid wallpaper name");
            let save = sub.get_one::<String>("save").expect("No save path");
            match client
                .get_wallpaper_preview_image(name)
                .await
                .expect("Failed to get wallpaper preview")
            {
                Some(png) => tokio::fs::write(save, png)
                    .await
                    .expect("Failed to save wallpaper preview"),
                None => eprintln!("Device returned no preview data"),
            }
        }
        Some(("wallpaper", sub)) => {
            let name = sub.get_one::<String>("name").expect("No name");
            let save = sub.get_one::<String>("save").expect("No save path");
            match client
                .get_wallpaper_pngdata(name.as_str())
                .await
                .expect("Failed to get wallpaper")
            {
                Some(png) => tokio::fs::write(save, png)
                    .await
                    .expect("Failed to save wallpaper"),
                None => eprintln!("Device returned no wallpaper data"),
            }
        }
        Some(("icon_metrics", _)) => {
            let metrics = client
                .get_homescreen_icon_metrics()
                .await
                .expect("Failed to get homescreen icon metrics");
            println!("{}", pretty_print_dictionary(&metrics));
        }
        Some(("orientation", _)) => {
            let orientation = client
                .get_interface_orientation()
                .await
                .expect("Failed to get interface orientation");
            match orientation {
                Some(raw) => match raw.typed() {
                    Ok(o) => println!("{o} ({})", raw.value()),
                    Err(e) => println!("{e}"),
                },
                None => eprintln!("Device returned no orientation"),
            }
        }
        _ => eprintln!("Invalid usage, pass -h for help"),
    }
}
