use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    time::Duration,
};

use watchparty_client::{
    api::{ApiError, CreateRoom, Direction, NewVideo, RoomsApi},
    constants::{LOCAL_WS_URL, RECONCILE_INTERVAL, VERSION},
    controller::{RoomController, RoomNotice},
    invite::{build_invite_url, parse_invite_url},
    player::{Player, PlayerError, PlayerEvent, PlayerStatus, SimulatedPlayer},
    playlist::Playlist,
    profile::{Profile, ProfileStore},
    protocol::Message,
    session::{spawn_sync_tasks, SharedSession, SyncSession},
    sync::SyncClient,
    utils::format_time,
    youtube::normalize_video_input,
};

type SharedController = Arc<Mutex<RoomController<SimulatedPlayer>>>;

/// Everything the command loop and the socket handler share
#[derive(Clone)]
struct App {
    sync: SyncClient,
    api: RoomsApi,
    session: SharedSession<SimulatedPlayer>,
    controller: SharedController,
    target: Arc<Mutex<JoinTarget>>,
    /// A join sent from the command line, adopted as the target once it succeeds
    requested: Arc<Mutex<Option<JoinTarget>>>,
    profile: Profile,
}

#[derive(Debug, Default)]
struct Args {
    room: Option<String>,
    category: Option<String>,
    name: Option<String>,
    server: Option<String>,
    passcode: Option<String>,
    invite: Option<String>,
}

/// The room this client is in (or trying to be in); rejoined after every reconnect
#[derive(Clone)]
struct JoinTarget {
    room_id: String,
    passcode: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_client=debug,info".into()),
        )
        .init();

    let mut args = parse_args();
    let server_url = args
        .server
        .take()
        .or_else(|| std::env::var("WATCHPARTY_SERVER").ok())
        .unwrap_or_else(|| LOCAL_WS_URL.to_string());

    let store = ProfileStore::new();
    let mut profile = store.load_or_create()?;
    if let Some(name) = args.name.take().filter(|n| !n.trim().is_empty()) {
        profile.display_name = name.trim().to_string();
        store.save(&profile)?;
    }
    tracing::info!("Watchparty client {} as {}", VERSION, profile.display_name);

    let api = RoomsApi::from_ws_url(&server_url).context("Invalid server url")?;
    warm_up_backend(&api).await;
    let target = resolve_target(&api, &mut args).await?;

    match api.get_room(&target.room_id).await {
        Ok(room) => println!("* room: {} ({})", room.room_name, room.category),
        Err(e) if e.is_not_found() => bail!("Room {} not found", target.room_id),
        Err(e) => tracing::warn!("Could not fetch room {}: {}", target.room_id, e),
    }

    let sync = SyncClient::new();
    let session = SyncSession::new(SimulatedPlayer::new(), Arc::new(sync.clone())).shared();
    session.lock().handle_player_event(PlayerEvent::Ready);
    let controller = Arc::new(Mutex::new(RoomController::new(Arc::clone(&session))));
    let app = App {
        sync: sync.clone(),
        api,
        session: Arc::clone(&session),
        controller,
        target: Arc::new(Mutex::new(target)),
        requested: Arc::new(Mutex::new(None)),
        profile,
    };

    let sync_tasks = spawn_sync_tasks(&session, sync.connection_watch());
    let end_watch = tokio::spawn(watch_for_end(Arc::clone(&session)));
    let connection = tokio::spawn(run_connection_loop(app.clone(), server_url));

    run_commands(&app).await?;

    if let Err(e) = sync.leave_room() {
        tracing::debug!("Leave not sent: {}", e);
    }
    drop(sync_tasks);
    end_watch.abort();
    connection.abort();
    Ok(())
}

fn parse_args() -> Args {
    let mut parsed = Args::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--room" => parsed.room = args.next(),
            "--category" => parsed.category = args.next(),
            "--name" => parsed.name = args.next(),
            "--server" => parsed.server = args.next(),
            "--passcode" => parsed.passcode = args.next(),
            "--invite-url" => parsed.invite = args.next(),
            other if other.starts_with("watchparty://")
                || other.starts_with("http://")
                || other.starts_with("https://") =>
            {
                parsed.invite = Some(other.to_string());
            }
            other => tracing::warn!("Ignoring unknown argument {}", other),
        }
    }
    parsed
}

async fn resolve_target(api: &RoomsApi, args: &mut Args) -> Result<JoinTarget> {
    if let Some(invite) = args.invite.take() {
        let link = parse_invite_url(&invite).context("Invite link has no room")?;
        return Ok(JoinTarget {
            room_id: link.room_id,
            passcode: link.passcode.or_else(|| args.passcode.take()),
        });
    }
    if let Some(room_id) = args.room.take() {
        return Ok(JoinTarget {
            room_id,
            passcode: args.passcode.take(),
        });
    }
    if let Some(slug) = args.category.take() {
        let room = api
            .category_room(&slug)
            .await
            .with_context(|| format!("Could not open a room for category {slug}"))?;
        return Ok(JoinTarget {
            room_id: room.id,
            passcode: None,
        });
    }
    bail!("Pass --room <id>, --category <slug> or an invite link")
}

async fn warm_up_backend(api: &RoomsApi) {
    match api.health().await {
        Ok(status) => tracing::info!(
            "Warmup request to {} returned {}",
            api.base_url(),
            status
        ),
        Err(e) => tracing::warn!("Warmup request to {} failed: {}", api.base_url(), e),
    }
}

async fn run_connection_loop(app: App, server_url: String) {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let handler_app = app.clone();
        match app
            .sync
            .connect(&server_url, move |msg| on_server_message(&handler_app, msg))
            .await
        {
            Ok(disconnected) => {
                tracing::info!("Connected to sync server at {}", server_url);
                app.sync.mark_connected(&server_url);
                attempt = 0;

                let join = app.target.lock().clone();
                if let Err(e) = app.sync.join_room(&join.room_id, &app.profile, join.passcode) {
                    tracing::warn!("Failed to send join: {}", e);
                }

                let _ = disconnected.await;
                app.sync.mark_disconnected();
                app.sync.clear_room();
                tracing::warn!("Disconnected from sync server, reconnecting");
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to sync server at {} (attempt {}): {}",
                    server_url,
                    attempt,
                    e
                );
            }
        }

        let capped_attempt = attempt.clamp(1, 6);
        tokio::time::sleep(Duration::from_secs(5 * capped_attempt as u64)).await;
    }
}

fn on_server_message(app: &App, msg: Message) {
    let (notice, client_id) = {
        let mut controller = app.controller.lock();
        let notice = controller.handle_server_message(msg);
        (notice, controller.client_id())
    };

    match notice {
        Some(RoomNotice::Joined(room)) => {
            if let Some(client_id) = client_id {
                app.sync.set_room_joined(room.id.clone(), client_id);
            }
            {
                // rejoin this room after a reconnect; a failed switch keeps the old one
                let requested = app.requested.lock().take().filter(|r| r.room_id == room.id);
                let mut target = app.target.lock();
                if let Some(requested) = requested {
                    *target = requested;
                } else if target.room_id != room.id {
                    *target = JoinTarget {
                        room_id: room.id.clone(),
                        passcode: None,
                    };
                }
            }
            println!("* joined {} [{}]", room.room_name, room.id);
            let app = app.clone();
            tokio::spawn(async move {
                if let Err(e) = load_catalog(&app, &room.category).await {
                    tracing::warn!("Could not load videos for {}: {}", room.category, e);
                }
            });
        }
        Some(RoomNotice::Left) => {
            app.sync.clear_room();
            println!("* left room");
        }
        Some(RoomNotice::UsersChanged(count)) => println!("* {count} user(s) here"),
        Some(RoomNotice::Chat(message)) => println!("<{}> {}", message.user_name, message.content),
        Some(RoomNotice::Error(message)) => println!("! {message}"),
        Some(RoomNotice::RoomGone) => println!("! room not found, sync stopped"),
        None => {}
    }
}

/// Fetch the category's videos into the session, so picks and auto-advance
/// use them, and teach the simulated player their lengths
async fn load_catalog(app: &App, category: &str) -> Result<Playlist, ApiError> {
    let videos = app.api.category_videos(category).await?;
    let playlist = Playlist::new(videos);
    let mut session = app.session.lock();
    for video in playlist.videos() {
        if let Some(seconds) = video.duration {
            session
                .player_mut()
                .set_known_duration(&video.video_id, seconds as f64);
        }
    }
    session.set_playlist(playlist.clone());
    tracing::debug!("{} videos listed for {}", playlist.videos().len(), category);
    Ok(playlist)
}

/// Report the simulated player running out, like a real player's end event
async fn watch_for_end(session: SharedSession<SimulatedPlayer>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    let mut was_ended = false;
    loop {
        ticker.tick().await;
        let mut guard = session.lock();
        let ended = matches!(guard.player().status(), Ok(PlayerStatus::Ended));
        if ended && !was_ended {
            guard.handle_player_event(PlayerEvent::Ended);
        }
        was_ended = ended;
    }
}

const HELP: &str = "\
commands:
  play | pause | seek <seconds> | video <url or id>
  videos | pick <n> | add <url or id> <title>
  rooms | join <room id> [passcode] | create <room name> | next | prev
  chat <text> | users | status | invite | quit";

async fn run_commands(app: &App) -> Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "" => {}
            "play" => drive(&app.session, PlayerEvent::Play, |player| player.play()),
            "pause" => drive(&app.session, PlayerEvent::Pause, |player| player.pause()),
            "seek" => match rest.parse::<f64>() {
                Ok(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                    drive(&app.session, PlayerEvent::Seeked, |player| {
                        player.seek(seconds)
                    })
                }
                _ => println!("! seek needs a position in seconds"),
            },
            "video" => match normalize_video_input(rest) {
                Some(video_id) => change_video(app, &video_id),
                None => println!("! not a YouTube link or video id"),
            },
            "videos" => list_videos(app).await,
            "pick" => match rest.parse::<usize>() {
                Ok(n) if n > 0 => {
                    let picked = app
                        .session
                        .lock()
                        .playlist()
                        .get(n - 1)
                        .map(|video| video.video_id.clone());
                    match picked {
                        Some(video_id) => change_video(app, &video_id),
                        None => println!("! no video {n}, run `videos` first"),
                    }
                }
                _ => println!("! pick needs a number from `videos`"),
            },
            "add" => add_video(app, rest).await,
            "rooms" => list_rooms(app).await,
            "join" => {
                let mut parts = rest.split_whitespace();
                match parts.next() {
                    Some(room_id) => request_join(app, room_id, parts.next().map(str::to_string)),
                    None => println!("! join needs a room id"),
                }
            }
            "create" if !rest.is_empty() => create_room(app, rest).await,
            "chat" if !rest.is_empty() => {
                if let Err(e) = app.sync.send_chat(rest) {
                    println!("! {e:#}");
                }
            }
            "users" => {
                let controller = app.controller.lock();
                if controller.users().is_empty() {
                    println!("  nobody here yet");
                }
                for user in controller.users() {
                    println!("  {} ({})", user.name, user.id);
                }
            }
            "status" => print_status(app),
            "next" | "prev" => {
                let direction = if command == "next" {
                    Direction::Next
                } else {
                    Direction::Prev
                };
                switch_room(app, direction).await;
            }
            "invite" => {
                let join = app.target.lock().clone();
                println!("{}", build_invite_url(&join.room_id, join.passcode.as_deref()));
            }
            "quit" | "exit" => break,
            _ => println!("{HELP}"),
        }
    }
    Ok(())
}

/// Apply a local control to the player, then report it like a real player would
fn drive<F>(session: &SharedSession<SimulatedPlayer>, event: PlayerEvent, action: F)
where
    F: FnOnce(&mut SimulatedPlayer) -> Result<(), PlayerError>,
{
    let mut session = session.lock();
    match action(session.player_mut()) {
        Ok(()) => session.handle_player_event(event),
        Err(e) => println!("! {e}"),
    }
}

fn request_join(app: &App, room_id: &str, passcode: Option<String>) {
    *app.requested.lock() = Some(JoinTarget {
        room_id: room_id.to_string(),
        passcode: passcode.clone(),
    });
    if let Err(e) = app.sync.join_room(room_id, &app.profile, passcode) {
        println!("! {e:#}");
    }
}

fn change_video(app: &App, video_id: &str) {
    if let Err(e) = app.session.lock().change_video(video_id) {
        println!("! could not load video: {e}");
    }
}

fn current_category(app: &App) -> Option<String> {
    app.controller.lock().room().map(|room| room.category.clone())
}

async fn list_videos(app: &App) {
    let Some(category) = current_category(app) else {
        println!("! not in a room yet");
        return;
    };
    match load_catalog(app, &category).await {
        Ok(playlist) if playlist.is_empty() => println!("  no videos listed for {category}"),
        Ok(playlist) => {
            let playing = app.session.lock().room_state().map(|s| s.video_url.clone());
            for (n, video) in playlist.videos().iter().enumerate() {
                let marker = if playing.as_deref() == Some(video.video_id.as_str()) {
                    ">"
                } else {
                    " "
                };
                let length = video
                    .duration
                    .map(|secs| format!(" [{}]", format_time(secs as f64)))
                    .unwrap_or_default();
                println!("{marker} {:>2}. {}{}", n + 1, video.title, length);
            }
        }
        Err(e) => println!("! {e}"),
    }
}

async fn add_video(app: &App, rest: &str) {
    let (link, title) = rest.split_once(' ').unwrap_or((rest, ""));
    let Some(video_id) = normalize_video_input(link) else {
        println!("! add needs a YouTube link or video id, then a title");
        return;
    };
    let Some(category) = current_category(app) else {
        println!("! not in a room yet");
        return;
    };
    let title = match title.trim() {
        "" => video_id.clone(),
        title => title.to_string(),
    };
    let video = NewVideo {
        video_id,
        title,
        channel_title: None,
        duration: None,
    };
    match app.api.add_category_video(&category, &video).await {
        Ok(added) => {
            println!("* added {} to {}", added.title, added.category);
            if let Err(e) = load_catalog(app, &category).await {
                tracing::warn!("Could not refresh videos: {}", e);
            }
        }
        Err(e) => println!("! {e}"),
    }
}

async fn list_rooms(app: &App) {
    let category = current_category(app);
    match app.api.list_rooms(category.as_deref()).await {
        Ok(rooms) => {
            let current = app.sync.current_room();
            for room in rooms {
                let marker = if current.as_deref() == Some(room.id.as_str()) {
                    ">"
                } else {
                    " "
                };
                println!(
                    "{marker} {} {} ({}){}",
                    room.id,
                    room.room_name,
                    room.category,
                    if room.passcode_enabled { " locked" } else { "" }
                );
            }
        }
        Err(e) => println!("! {e}"),
    }
}

async fn create_room(app: &App, name: &str) {
    let Some(category) = current_category(app) else {
        println!("! not in a room yet");
        return;
    };
    let request = CreateRoom {
        room_name: name.to_string(),
        category,
        is_public: true,
        video_url: None,
        passcode: None,
    };
    match app.api.create_room(&request).await {
        Ok(room) => {
            println!("* created {} [{}]", room.room_name, room.id);
            request_join(app, &room.id, None);
        }
        Err(e) => println!("! {e}"),
    }
}

async fn switch_room(app: &App, direction: Direction) {
    let current = app.target.lock().room_id.clone();
    match app.api.neighbor(&current, direction).await {
        Ok(room) if room.id == current => println!("* no other rooms in {}", room.category),
        Ok(room) => request_join(app, &room.id, None),
        Err(e) => {
            if e.is_not_found() {
                app.controller.lock().fail(e.to_string());
            }
            println!("! {e}");
        }
    }
}

fn print_status(app: &App) {
    {
        let session = app.session.lock();
        let position = session.player().current_time().unwrap_or(0.0);
        println!(
            "  phase {:?}, active {}, player {:?} at {}",
            session.phase(),
            session.is_active(),
            session.player().status().ok(),
            format_time(position)
        );
        if let Some(state) = session.room_state() {
            println!(
                "  room: {} at {} ({})",
                if state.video_url.is_empty() {
                    "no video"
                } else {
                    state.video_url.as_str()
                },
                format_time(state.leader_time),
                if state.is_playing { "playing" } else { "paused" }
            );
        }
    }

    {
        let controller = app.controller.lock();
        if let Some(error) = controller.error() {
            println!("  error: {error}");
        }
        if controller.is_halted() {
            println!("  sync stopped until the next join");
        }
    }

    let stats = app.sync.stats_snapshot();
    let membership = match (app.sync.current_room(), app.sync.client_id()) {
        (Some(room), Some(client)) => format!("in {room} as {client}"),
        _ => "not in a room".to_string(),
    };
    println!(
        "  {} | {} | sent {} msgs, received {} msgs{}",
        if app.sync.is_connected() { "connected" } else { "offline" },
        membership,
        stats.messages_out,
        stats.messages_in,
        stats
            .last_rtt_ms
            .map(|rtt| format!(", rtt {rtt:.0} ms"))
            .unwrap_or_default()
    );
}
