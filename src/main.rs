mod host;
mod logging;
mod models;
mod scenario;
mod simulation;

use clap::{Arg, Command};
use logging::{init_logging, LogConfig, LogOutput};
use scenario::ScenarioConfig;
use simulation::{EpisodeEngine, SyntheticRange};
use tracing::Level;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("aimsim")
        .version("0.1.0")
        .about("射撃校正シミュレーション (Projectile Aiming Simulation)")
        .long_about("オンライン較正型の射撃エージェントシミュレーション\n\
                     観測された着弾結果から弾道補正モデルをティック駆動で学習します。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help("実行するシナリオファイル(.yaml)のパスを指定します。\n\
                           指定しない場合、デフォルトのシナリオで実行されます。")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
                .conflicts_with("test")
        )
        .arg(
            Arg::new("test")
                .short('t')
                .long("test")
                .action(clap::ArgAction::SetTrue)
                .help("合成射撃場での短い動作確認を実行")
                .conflicts_with("info")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("DEST")
                .help("ログ出力先 (console, file, both)")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: デバッグ)")
        )
        .get_matches();

    println!("射撃校正シミュレーション (Projectile Aiming Simulation) - aimsim v0.1.0");
    println!();

    // 詳細レベルの設定
    let verbose_level = matches.get_count("verbose");
    let log_level = match verbose_level {
        0 | 1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let log_output = matches
        .get_one::<String>("log-output")
        .and_then(|s| s.parse::<LogOutput>().ok())
        .unwrap_or(LogOutput::Console);

    if log_output != LogOutput::Console {
        if let Err(e) = logging::ensure_log_directory("logs") {
            eprintln!("エラー: ログディレクトリを作成できません: {}", e);
            std::process::exit(1);
        }
    }
    if let Err(e) = init_logging(LogConfig {
        level: log_level,
        output: log_output,
        ..LogConfig::default()
    }) {
        eprintln!("エラー: ログ初期化に失敗しました: {}", e);
        std::process::exit(1);
    }

    // テストモードの実行
    if matches.get_flag("test") {
        println!("=== 合成射撃場テストモード ===");
        if let Err(e) = run_synthetic_test(verbose_level) {
            eprintln!("エラー: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // シナリオファイルの処理
    if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        match run_scenario(scenario_path, matches.get_flag("info"), verbose_level) {
            Ok(_) => {
                if verbose_level > 0 {
                    println!("シナリオ実行が正常に完了しました。");
                }
            }
            Err(e) => {
                eprintln!("エラー: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        // デフォルト動作: 使用方法とシナリオ一覧を表示
        show_default_help();
    }
}

/// 合成射撃場での短い動作確認
///
/// デフォルトシナリオのエージェントを組み込みホストに対して1エピソード
/// 実行し、ショット数と較正サンプル数を表示します。
fn run_synthetic_test(verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    let mut scenario = ScenarioConfig::default();
    scenario.sim.max_ticks = 600;
    scenario.sim.episodes = 1;

    let mut engine = EpisodeEngine::new(scenario.clone(), verbose_level)?;
    let mut range = SyntheticRange::new(scenario, 10_000);
    let reports = engine.run(&mut range)?;

    for report in &reports {
        println!(
            "エピソード{}: {}ティック / {}ショット / {}命中",
            report.episode, report.ticks, report.shots, report.hits
        );
    }
    println!(
        "較正サンプル数: {}",
        engine.shooter.store().total_len()
    );
    println!("\n動作確認が完了しました！");
    Ok(())
}

/// シナリオファイルを読み込んで実行
fn run_scenario(scenario_path: &str, info_only: bool, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    // シナリオファイルの読み込み
    let scenario = ScenarioConfig::from_file(scenario_path)?;

    if verbose_level > 0 {
        println!("シナリオファイル読み込み完了: {}", scenario_path);
    }

    // 情報表示のみの場合
    if info_only {
        scenario.print_summary();
        return Ok(());
    }

    // シナリオ実行
    execute_scenario(scenario, verbose_level)?;

    Ok(())
}

/// シナリオの実行
///
/// 接続先ホストの実装は外部コラボレータの責務のため、実行は組み込みの
/// 合成射撃場に対して行います。
fn execute_scenario(scenario: ScenarioConfig, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    // 基本情報表示
    scenario.print_summary();
    println!();

    if verbose_level > 0 {
        println!("シミュレーション設定:");
        println!("  時間刻み: {:.3}秒", scenario.sim.tick_s);
        println!("  最大ティック数: {}", scenario.sim.max_ticks);
        println!("  エピソード数: {}", scenario.sim.episodes);
        println!("  シード値: {}", scenario.sim.seed);
        println!();
    }

    let mission_ticks = scenario.sim.max_ticks * scenario.sim.episodes as u64 + 1;
    let mut engine = EpisodeEngine::new(scenario.clone(), verbose_level)?;
    let mut range = SyntheticRange::new(scenario, mission_ticks);
    let reports = engine.run(&mut range)?;

    println!();
    for report in &reports {
        println!(
            "エピソード{}: {}ティック / {}ショット / {}命中",
            report.episode, report.ticks, report.shots, report.hits
        );
    }

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  aimsim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>  シナリオファイルを指定して実行");
    println!("  -i, --info             シナリオ情報のみ表示");
    println!("  -t, --test             合成射撃場での動作確認を実行");
    println!("  --log-output <DEST>    ログ出力先 (console, file, both)");
    println!("  -v, --verbose          詳細出力 (複数指定で詳細レベル上昇)");
    println!("  -h, --help             このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/static_target.yaml    - 静止ターゲット（基本較正）");
    println!("  scenarios/strafing_target.yaml  - 往復移動ターゲット（先行補正）");
    println!();
    println!("例:");
    println!("  aimsim -s scenarios/static_target.yaml");
    println!("  aimsim -s scenarios/strafing_target.yaml -v");
    println!("  aimsim -s scenarios/static_target.yaml -i");
    println!("  aimsim --test");
}
