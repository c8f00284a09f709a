use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn duoshade(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_duoshade"))
        .env("DUOSHADE_CONFIG_DIR", root.join("config"))
        .env("DUOSHADE_DATA_DIR", root.join("data"))
        .env_remove("DUOSHADE_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run duoshade")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn config_init_writes_the_template_once() {
    let root = TempDir::new().unwrap();
    let stage = root.path().join("config/stage.toml");

    let first = duoshade(root.path(), &["config", "init"]);
    assert!(first.status.success());
    assert!(stage.exists());
    assert!(fs::read_to_string(&stage).unwrap().contains("[sync]"));

    let second = duoshade(root.path(), &["config", "init"]);
    assert!(!second.status.success());

    fs::write(&stage, "version = 1\n").unwrap();
    let forced = duoshade(root.path(), &["config", "init", "--force"]);
    assert!(forced.status.success());
    assert!(fs::read_to_string(&stage).unwrap().contains("[mixer]"));
}

#[test]
fn config_where_reports_overridden_dirs() {
    let root = TempDir::new().unwrap();
    let output = duoshade(root.path(), &["config", "where"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(text.contains(&root.path().join("config").display().to_string()));
    assert!(text.contains(&root.path().join("data/captures").display().to_string()));
}

#[test]
fn config_check_validates_the_file() {
    let root = TempDir::new().unwrap();
    assert!(duoshade(root.path(), &["config", "init"]).status.success());

    let output = duoshade(root.path(), &["config", "check"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("is valid"));

    let printed = duoshade(root.path(), &["config", "check", "--print"]);
    assert!(printed.status.success());
    assert!(stdout(&printed).contains("framing = \"direct\""));

    fs::write(
        root.path().join("config/stage.toml"),
        "version = 1\n[mixer]\nblend = \"sideways\"\n",
    )
    .unwrap();
    assert!(!duoshade(root.path(), &["config", "check"]).status.success());
}

#[test]
fn check_accepts_a_valid_shader() {
    let root = TempDir::new().unwrap();
    let program = root.path().join("glow.glsl");
    fs::write(
        &program,
        "// @param warp float 0.25 0 1\n\
         // @channel0 texture noise.png\n\
         void mainImage(out vec4 fragColor, in vec2 fragCoord) {\n\
             fragColor = vec4(fragCoord / iResolution.xy, 0.5, 1.0);\n\
         }\n",
    )
    .unwrap();

    let output = duoshade(root.path(), &["check", program.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("1 params, 1 channels"));
    assert!(text.contains("warp"));

    let json = duoshade(root.path(), &["check", "--json", program.to_str().unwrap()]);
    assert!(json.status.success());
    let report: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(report["kind"], "shader");
    assert_eq!(report["params"][0]["name"], "warp");
    assert_eq!(report["channels"][0]["textureName"], "noise.png");
}

#[test]
fn check_rejects_a_broken_shader() {
    let root = TempDir::new().unwrap();
    let program = root.path().join("broken.glsl");
    fs::write(&program, "void mainImage(out vec4 c, in vec2 p) { c = nope; }\n").unwrap();

    let output = duoshade(root.path(), &["check", program.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken.glsl"));
}

#[test]
fn crop_trims_a_uniform_border() {
    let root = TempDir::new().unwrap();
    let input = root.path().join("framed.png");
    let output = root.path().join("cropped.png");

    let mut framed = image::RgbaImage::from_pixel(10, 8, image::Rgba([0, 0, 0, 255]));
    for y in 2..5 {
        for x in 3..7 {
            framed.put_pixel(x, y, image::Rgba([200, 40, 40, 255]));
        }
    }
    framed.save(&input).unwrap();

    let result = duoshade(
        root.path(),
        &["crop", input.to_str().unwrap(), output.to_str().unwrap()],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    assert!(stdout(&result).contains("10x8 -> 4x3"));

    let cropped = image::open(&output).unwrap().to_rgba8();
    assert_eq!(cropped.dimensions(), (4, 3));
    assert_eq!(cropped.get_pixel(0, 0), &image::Rgba([200, 40, 40, 255]));
}
