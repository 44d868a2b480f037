//! Launch profiles: wiring the resolver, the builder, and the surrogates
//! together for the browser, the daemon, and the updater.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::config::{Config, Dirs};
use crate::dynlib::{
    self, BinaryInspector, ElfInspector, LoaderCache, find_ld_so, resolve_libraries,
};
use crate::error::{Error, Result};
use crate::surrogate::x11::X11Surrogate;
use crate::tor::Tor;
use crate::utils::{self, DIR_MODE};

use super::builder::{RESTRICTED_LIB_DIR, SandboxBuilder};
use super::process::Process;
use super::seccomp::{self, PolicyCompiler, Profile};
use super::x11;

const PROFILE_SUBDIR: &str = "TorBrowser/Data/Browser/profile.default";
const CACHES_SUBDIR: &str = "TorBrowser/Data/Browser/Caches";
const STUB_SANDBOX_PATH: &str = "/home/amnesia/.tbb_stub.so";

const CONTROL_SOCKET: &str = "control";
const SOCKS_SOCKET: &str = "socks";
const X11_SOCKET: &str = "xorg";

/// Extensions the profile is expected to carry; anything else stays
/// invisible behind the tmpfs.
const EXTENSION_WHITELIST: &[&str] = &[
    "{73a6fe31-595d-460b-a920-fcc0f8843232}.xpi", // NoScript
    "torbutton@torproject.org.xpi",
    "https-everywhere-eff@eff.org.xpi",
    "tor-launcher@torproject.org.xpi",
];

/// Library directories that vary by distribution, in search order.  Doubles
/// as the resolver's fallback search path.
fn distribution_lib_search_path() -> Vec<PathBuf> {
    ["/usr/lib64", "/usr/lib/x86_64-linux-gnu", "/usr/lib"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

/// Launches the sandboxed browser against the running surrogates.
pub fn run_browser(
    cfg: &Config,
    dirs: &Dirs,
    tor: &Tor,
    compiler: Option<Arc<dyn PolicyCompiler>>,
) -> Result<Process> {
    let mut h = SandboxBuilder::new(cfg.sandbox.helper.as_deref())?;
    h.log_prefix = "firefox".into();
    h.fake_dbus = true;
    h.mount_proc = true;
    install_seccomp(&mut h, compiler, dirs, Profile::Browser);

    // Gtk bits the browser chrome needs to render sanely.
    h.ro_bind(
        Path::new("/usr/share/icons/hicolor"),
        Path::new("/usr/share/icons/hicolor"),
        true,
    )?;
    h.ro_bind(Path::new("/usr/share/mime"), Path::new("/usr/share/mime"), false)?;
    h.ro_bind(
        Path::new("/usr/share/glib-2.0/schemas"),
        Path::new("/usr/share/glib-2.0/schemas"),
        false,
    )?;
    h.ro_bind(
        Path::new("/usr/share/icons/gnome"),
        Path::new("/usr/share/icons/gnome"),
        true,
    )?;
    // Thai language support.
    h.ro_bind(
        Path::new("/usr/share/libthai/thbrk.tri"),
        Path::new("/usr/share/libthai/thbrk.tri"),
        true,
    )?;

    let browser_home = h.home_dir().join("sandboxed-tor-browser/tor-browser/Browser");
    let real_browser_home = dirs.bundle.join("Browser");
    let real_profile_dir = real_browser_home.join(PROFILE_SUBDIR);
    let real_caches_dir = real_browser_home.join(CACHES_SUBDIR);
    let real_extensions_dir = real_profile_dir.join("extensions");
    let mut real_desktop_dir = real_browser_home.join("Desktop");
    let mut real_downloads_dir = real_browser_home.join("Downloads");

    // The mount points must exist on the host side.
    for dir in [&real_caches_dir, &real_desktop_dir, &real_downloads_dir] {
        utils::create_directory_recursive(dir, DIR_MODE)?;
    }
    if let Some(desktop) = &cfg.sandbox.desktop_dir {
        real_desktop_dir = desktop.clone();
    }
    if let Some(downloads) = &cfg.sandbox.downloads_dir {
        real_downloads_dir = downloads.clone();
    }

    let profile_dir = browser_home.join(PROFILE_SUBDIR);
    let caches_dir = browser_home.join(CACHES_SUBDIR);
    let desktop_dir = browser_home.join("Desktop");
    let downloads_dir = browser_home.join("Downloads");
    let extensions_dir = profile_dir.join("extensions");

    h.ro_bind(
        &dirs.bundle,
        &h.home_dir().join("sandboxed-tor-browser/tor-browser"),
        false,
    )?;

    let pref_file = "prefs.js";
    if cfg.sandbox.amnesiac_profile {
        // Profile writes go to a tmpfs replica and vanish on exit; the
        // prefs and the extensions keep their own mounts below.
        let excludes = vec![
            real_profile_dir.join(pref_file),
            real_extensions_dir.clone(),
        ];
        h.shadow_dir(&profile_dir, &real_profile_dir, &excludes)?;
    } else {
        h.bind(&real_profile_dir, &profile_dir, false)?;
    }
    h.ro_bind(
        &real_profile_dir.join(pref_file),
        &profile_dir.join(pref_file),
        true,
    )?;
    h.bind(&real_desktop_dir, &desktop_dir, false)?;
    h.bind(&real_downloads_dir, &downloads_dir, false)?;
    h.tmpfs(&caches_dir);
    h.chdir = Some(browser_home.clone());

    // Only expected extensions are visible, by explicit mount.
    h.tmpfs(&extensions_dir);
    for ext_name in EXTENSION_WHITELIST {
        h.ro_bind(
            &real_extensions_dir.join(ext_name),
            &extensions_dir.join(ext_name),
            false,
        )?;
    }

    h.setenv(
        "FONTCONFIG_PATH",
        browser_home.join("TorBrowser/Data/fontconfig"),
    );
    h.setenv("FONTCONFIG_FILE", "fonts.conf");

    // A read-only home upsets GNOME systems; symlinks into the bundle tree
    // are friendlier than moving $HOME anyway.
    h.symlink(desktop_dir.as_os_str(), "/home/amnesia/Desktop");
    h.symlink(downloads_dir.as_os_str(), "/home/amnesia/Downloads");

    // The browser is told a system tor manages the network; both "ports"
    // actually terminate at the surrogates.
    h.setenv("TOR_SOCKS_PORT", "9150");
    h.setenv("TOR_CONTROL_PORT", "9151");
    h.setenv("TOR_SKIP_LAUNCH", "1");
    h.setenv("TOR_NO_DISPLAY_NETWORK_SETTINGS", "1");
    h.setenv("TOR_HIDE_UPDATE_CHECK_UI", "1");

    // The AF_LOCAL compatibility stub and the surrogate sockets it
    // redirects the browser's TCP connects to.
    let ctrl_path = h.runtime_dir().join(CONTROL_SOCKET);
    let socks_path = h.runtime_dir().join(SOCKS_SOCKET);
    h.setenv("TOR_STUB_CONTROL_SOCKET", ctrl_path.clone());
    h.setenv("TOR_STUB_SOCKS_SOCKET", socks_path.clone());
    h.bind(&tor.ctrl_surrogate_path()?, &ctrl_path, false)?;
    h.bind(&tor.socks_surrogate_path()?, &socks_path, false)?;

    let stub_path = cfg
        .sandbox
        .stub
        .clone()
        .unwrap_or_else(|| dirs.data.join("tbb_stub.so"));
    let stub = fs::read(&stub_path).map_err(|e| {
        Error::Config(format!(
            "companion stub library not found at {}: {e}",
            stub_path.display()
        ))
    })?;
    h.file(Path::new(STUB_SANDBOX_PATH), stub);
    h.setenv("LD_PRELOAD", STUB_SANDBOX_PATH);

    // Hardware accelerated OpenGL will not work, and never will.
    h.setenv("LIBGL_ALWAYS_SOFTWARE", "1");
    // Crashdumps, sanitized or not, are not to be trusted.
    h.setenv("MOZ_CRASHREPORTER_DISABLE", "1");
    // The host D-Bus stays unreachable; silence the AT-SPI warnings.
    h.setenv("NO_AT_BRIDGE", "yes");
    h.setenv("GDK_PIXBUF_MODULE_FILE", "/dev/null");

    let firefox = real_browser_home.join("firefox");
    let mut extra_ld_library_path = String::new();
    if dynlib::is_supported() {
        let inspector = ElfInspector;
        let cache = LoaderCache::load(Path::new(dynlib::LD_SO_CACHE), &inspector)?;

        // Firefox links everything interesting through its own .so files,
        // so they all seed the closure.
        let mut binaries = vec![firefox.clone()];
        for entry in fs::read_dir(&real_browser_home)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "so") {
                binaries.push(path);
            }
        }
        let mut search_path = vec![
            real_browser_home.clone(),
            real_browser_home.join("TorBrowser/Tor"),
        ];

        // Libraries only reached via dlopen(3); libxul crashes without the
        // xcb trio.
        let mut extra_libs: Vec<String> = ["libxcb.so.1", "libXau.so.6", "libXdmcp.so.6"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        if let Some((gl_libs, gl_dir)) = append_restricted_opengl(&mut h)? {
            extra_libs.extend(gl_libs);
            search_path.push(gl_dir);
        }

        let allow_ffmpeg = cfg.sandbox.enable_av_codec
            && match find_best_codec(&cache) {
                Some(codec) => {
                    extra_libs.push(codec);
                    true
                }
                None => false,
            };
        let filter = move |path: &Path| filter_codecs(path, allow_ffmpeg);

        let closure = resolve_libraries(
            &cache,
            &inspector,
            &binaries,
            &extra_libs,
            &search_path,
            &distribution_lib_search_path(),
            Some(&filter),
        )?;
        let ld_so = find_ld_so(&cache)?;
        h.append_libraries(&closure, &ld_so)?;
        extra_ld_library_path = format!(":{RESTRICTED_LIB_DIR}");
    }
    h.setenv(
        "LD_LIBRARY_PATH",
        format!(
            "{}{extra_ld_library_path}",
            browser_home.join("TorBrowser/Tor").display()
        ),
    );

    h.cmd = browser_home.join("firefox");
    h.cmd_args = vec![
        "--class".into(),
        "Tor Browser".into(),
        "-profile".into(),
        profile_dir.as_os_str().to_os_string(),
    ];

    // X11 goes last, because of the surrogate.
    let x = x11::resolve(cfg.sandbox.display.as_deref(), &h.hostname.clone())?;
    h.setenv("DISPLAY", x.display);
    h.dir(Path::new(x11::SOCK_DIR));
    if let Some(xauthority) = &x.xauthority {
        let xauth_path = h.home_dir().join(".Xauthority");
        h.setenv("XAUTHORITY", xauth_path.clone());
        h.file(&xauth_path, xauthority.clone());
    }
    let x_surrogate = X11Surrogate::launch(
        &x.host_socket,
        &dirs.runtime.join(X11_SOCKET),
        x.auth.as_ref(),
    )?;
    h.bind(
        x_surrogate.path(),
        &Path::new(x11::SOCK_DIR).join("X0"),
        false,
    )?;

    let surrogate = x_surrogate.clone();
    match h.run() {
        Ok(mut process) => {
            process.add_term_hook(move || {
                debug!("x11: cleaning up surrogate");
                surrogate.close();
            });
            Ok(process)
        }
        Err(e) => {
            x_surrogate.close();
            Err(e)
        }
    }
}

/// Launches the sandboxed daemon with the given torrc contents.  The
/// network namespace stays shared; the daemon is the one thing that needs
/// the host network.
pub fn run_tor(
    cfg: &Config,
    dirs: &Dirs,
    torrc: Vec<u8>,
    compiler: Option<Arc<dyn PolicyCompiler>>,
) -> Result<Process> {
    let mut h = SandboxBuilder::new(cfg.sandbox.helper.as_deref())?;
    h.log_prefix = "tor".into();
    h.unshare.net = false;
    // The daemon degrades gracefully without /proc, and with it the
    // sandbox would leak rather more than MaxMemInQueues is worth.
    h.mount_proc = false;
    install_seccomp(
        &mut h,
        compiler,
        dirs,
        Profile::Tor {
            bridges: cfg.tor.use_bridges,
        },
    );

    utils::create_directory_recursive(&dirs.tor_data, DIR_MODE)?;

    let real_tor_home = dirs.bundle.join("Browser/TorBrowser/Tor");
    let real_tor_bin = real_tor_home.join("tor");
    let real_geoip_dir = dirs.bundle.join("Browser/TorBrowser/Data/Tor");

    let tor_dir = h.home_dir().join("tor");
    let tor_bin_dir = tor_dir.join("bin");
    let torrc_path = tor_dir.join("etc/torrc");

    h.dir(&tor_dir);
    h.ro_bind(&real_tor_home, &tor_bin_dir, false)?;
    for geoip in ["geoip", "geoip6"] {
        h.ro_bind(&real_geoip_dir.join(geoip), &tor_dir.join("etc").join(geoip), false)?;
    }
    h.bind(&dirs.tor_data, &tor_dir.join("data"), false)?;
    h.file(&torrc_path, torrc);

    let mut extra_ld_library_path = String::new();
    if dynlib::is_supported() {
        let inspector = ElfInspector;
        let cache = LoaderCache::load(Path::new(dynlib::LD_SO_CACHE), &inspector)?;

        // Pluggable transports use a subset of the daemon's libraries.
        let closure = resolve_libraries(
            &cache,
            &inspector,
            &[real_tor_bin.clone()],
            &[],
            &[real_tor_home.clone()],
            &distribution_lib_search_path(),
            None,
        )?;
        let ld_so = find_ld_so(&cache)?;
        h.append_libraries(&closure, &ld_so)?;
        extra_ld_library_path = format!(":{RESTRICTED_LIB_DIR}");
    }
    h.setenv(
        "LD_LIBRARY_PATH",
        format!("{}{extra_ld_library_path}", tor_bin_dir.display()),
    );

    h.cmd = tor_bin_dir.join("tor");
    h.cmd_args = vec!["-f".into(), torrc_path.into_os_string()];

    h.run()
}

/// The torrc for a launcher-managed daemon, phrased in sandbox paths.
pub fn build_torrc(cfg: &Config) -> Vec<u8> {
    let mut torrc = String::from(
        "DataDirectory /home/amnesia/tor/data\n\
         GeoIPFile /home/amnesia/tor/etc/geoip\n\
         GeoIPv6File /home/amnesia/tor/etc/geoip6\n\
         SocksPort unix:/home/amnesia/tor/data/socks\n\
         ControlPort unix:/home/amnesia/tor/data/control\n\
         ControlPortWriteToFile /home/amnesia/tor/data/control_port\n\
         CookieAuthentication 1\n\
         DisableNetwork 1\n\
         Log notice stdout\n",
    );

    if cfg.tor.use_bridges {
        torrc.push_str("UseBridges 1\n");
        for bridge in &cfg.tor.bridges {
            torrc.push_str("Bridge ");
            torrc.push_str(bridge);
            torrc.push('\n');
        }
    }
    torrc.into_bytes()
}

/// Applies a MAR update the way the browser's own updater expects:
/// staged outside the installation, run against it, status checked after.
pub fn run_update(
    cfg: &Config,
    dirs: &Dirs,
    mar: &[u8],
    compiler: Option<Arc<dyn PolicyCompiler>>,
) -> Result<()> {
    let mut h = SandboxBuilder::new(cfg.sandbox.helper.as_deref())?;
    h.log_prefix = "update".into();
    install_seccomp(&mut h, compiler, dirs, Profile::Browser);

    let install_dir = h.home_dir().join("sandboxed-tor-browser/tor-browser");
    let update_dir = h.home_dir().join("sandboxed-tor-browser/update");
    let browser_home = install_dir.join("Browser");

    let real_install_dir = dirs.bundle.clone();
    let real_update_dir = dirs.data.join("update");
    let real_update_bin = real_install_dir.join("Browser/updater");

    stage_update(&real_update_dir, &real_install_dir, mar)?;

    h.bind(&real_install_dir, &install_dir, false)?;
    h.bind(&real_update_dir, &update_dir, false)?;
    h.chdir = Some(browser_home.clone());

    let mut extra_ld_library_path = String::new();
    if dynlib::is_supported() {
        let inspector = ElfInspector;
        let cache = LoaderCache::load(Path::new(dynlib::LD_SO_CACHE), &inspector)?;
        let closure = resolve_libraries(
            &cache,
            &inspector,
            &[real_update_bin.clone()],
            &[],
            &[real_install_dir.join("Browser")],
            &distribution_lib_search_path(),
            None,
        )?;
        let ld_so = find_ld_so(&cache)?;
        h.append_libraries(&closure, &ld_so)?;
        extra_ld_library_path = format!(":{RESTRICTED_LIB_DIR}");
    }
    h.setenv(
        "LD_LIBRARY_PATH",
        format!("{}{extra_ld_library_path}", browser_home.display()),
    );

    h.cmd = update_dir.join("updater");
    h.cmd_args = vec![
        update_dir.as_os_str().to_os_string(),
        browser_home.as_os_str().to_os_string(),
        browser_home.as_os_str().to_os_string(),
    ];

    let mut process = h.run()?;
    process.wait();

    let status = fs::read(real_update_dir.join("update.status"))?;
    let status = String::from_utf8_lossy(&status);
    let status = status.trim();
    if status != "succeeded" {
        return Err(Error::SandboxBuild(format!(
            "failed to apply update: {status}"
        )));
    }

    // The staging directory has served its purpose.
    let _ = fs::remove_dir_all(&real_update_dir);
    Ok(())
}

fn stage_update(update_dir: &Path, install_dir: &Path, mar: &[u8]) -> Result<()> {
    utils::create_directory_recursive(update_dir, DIR_MODE)?;

    // The updater binary runs from outside the tree it replaces.
    let updater_src = install_dir.join("Browser/updater");
    let meta = fs::metadata(&updater_src)?;
    let bytes = fs::read(&updater_src)?;
    fs::write(update_dir.join("updater"), bytes)?;
    fs::set_permissions(update_dir.join("updater"), meta.permissions())?;

    fs::write(update_dir.join("update.mar"), mar)?;
    Ok(())
}

fn install_seccomp(
    h: &mut SandboxBuilder,
    compiler: Option<Arc<dyn PolicyCompiler>>,
    dirs: &Dirs,
    profile: Profile,
) {
    match compiler {
        Some(compiler) => {
            let data_dir = dirs.data.clone();
            h.seccomp_fn = Some(Box::new(move |w| {
                seccomp::install(&*compiler, &data_dir, profile, w)
            }));
        }
        None => warn!("sandbox: no seccomp policy compiler, omitting the filter"),
    }
}

/// Finds the software rasterizer so LIBGL_ALWAYS_SOFTWARE has something to
/// load, binding it under the restricted lib dir.
fn append_restricted_opengl(h: &mut SandboxBuilder) -> Result<Option<(Vec<String>, PathBuf)>> {
    const SWRAST: &str = "swrast_dri.so";

    let mut search = vec![PathBuf::from("/usr/lib/xorg/modules")];
    search.extend(distribution_lib_search_path());

    for base in search {
        let candidate = base.join("dri").join(SWRAST);
        if !utils::file_exists(&candidate) || ElfInspector.verify_class(&candidate).is_err() {
            continue;
        }

        let restricted_dri = Path::new(RESTRICTED_LIB_DIR).join("dri");
        h.ro_bind(&candidate, &restricted_dri.join(SWRAST), false)?;
        h.setenv("LIBGL_DRIVERS_PATH", restricted_dri);

        // Debian needs libGL.so.1 named explicitly.
        let libs = vec![SWRAST.to_string(), "libGL.so.1".to_string()];
        let dri_dir = candidate.parent().map(Path::to_path_buf).unwrap_or_default();
        return Ok(Some((libs, dri_dir)));
    }

    debug!("sandbox: no software rasterizer found");
    Ok(None)
}

/// Refuses AV codec libraries unless explicitly allowed.
fn filter_codecs(path: &Path, allow_ffmpeg: bool) -> Result<()> {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return Ok(());
    };

    let mut prefixes: Vec<&str> = vec!["libgstreamer", "libgstapp", "libgstvideo"];
    if allow_ffmpeg {
        prefixes.clear();
    } else {
        prefixes.push("libavcodec");
    }

    for prefix in prefixes {
        if name.starts_with(prefix) {
            return Err(Error::RejectedByFilter(path.to_path_buf()));
        }
    }
    Ok(())
}

/// The newest codec library the cache knows that the browser can use.
/// The list tracks what firefox will actually dlopen.
fn find_best_codec(cache: &LoaderCache) -> Option<String> {
    const CODECS: &[&str] = &[
        "libavcodec-ffmpeg.so.57",
        "libavcodec-ffmpeg.so.56",
        "libavcodec.so.57",
        "libavcodec.so.56",
        "libavcodec.so.55",
        "libavcodec.so.54",
        "libavcodec.so.53",
    ];
    CODECS
        .iter()
        .find(|c| cache.lookup(c).is_some())
        .map(|c| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_codecs() {
        assert!(filter_codecs(Path::new("/usr/lib/libc.so.6"), false).is_ok());
        assert!(matches!(
            filter_codecs(Path::new("/usr/lib/libavcodec.so.57"), false),
            Err(Error::RejectedByFilter(_))
        ));
        assert!(filter_codecs(Path::new("/usr/lib/libavcodec.so.57"), true).is_ok());

        // gstreamer stays barred even with ffmpeg allowed.
        assert!(matches!(
            filter_codecs(Path::new("/usr/lib/libgstvideo-1.0.so"), true),
            Err(Error::RejectedByFilter(_))
        ));
        // Case-insensitive on the file name.
        assert!(filter_codecs(Path::new("/usr/lib/LibAvCodec.so"), false).is_err());
    }

    #[test]
    fn test_find_best_codec_prefers_newest() {
        let mut cache = LoaderCache::default();
        cache.insert_for_tests("libavcodec.so.55", Path::new("/usr/lib/libavcodec.so.55"));
        cache.insert_for_tests("libavcodec.so.57", Path::new("/usr/lib/libavcodec.so.57"));
        assert_eq!(
            find_best_codec(&cache).as_deref(),
            Some("libavcodec.so.57")
        );

        let empty = LoaderCache::default();
        assert_eq!(find_best_codec(&empty), None);
    }

    #[test]
    fn test_build_torrc() {
        let mut cfg = Config::default_for_tests();
        let torrc = String::from_utf8(build_torrc(&cfg)).unwrap();
        assert!(torrc.contains("CookieAuthentication 1"));
        assert!(torrc.contains("SocksPort unix:/home/amnesia/tor/data/socks"));
        assert!(torrc.contains("DisableNetwork 1"));
        assert!(!torrc.contains("UseBridges"));

        cfg.tor.use_bridges = true;
        cfg.tor.bridges = vec!["obfs4 192.0.2.1:443 cert=abc iat-mode=0".into()];
        let torrc = String::from_utf8(build_torrc(&cfg)).unwrap();
        assert!(torrc.contains("UseBridges 1"));
        assert!(torrc.contains("Bridge obfs4 192.0.2.1:443"));
    }
}
