use std::fmt::Write;

#[derive(Debug, Clone)]
struct OptionGuide {
    flag: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone)]
struct CommandGuide {
    names: &'static [&'static str],
    summary: &'static str,
    usage: &'static [&'static str],
    options: &'static [OptionGuide],
    examples: &'static [&'static str],
}

const GLOBAL_OPTIONS: &[OptionGuide] = &[
    OptionGuide {
        flag: "-h, --help",
        description: "Show contextual help information.",
    },
    OptionGuide {
        flag: "--version",
        description: "Print the imgshard version.",
    },
    OptionGuide {
        flag: "--config <file>",
        description: "YAML configuration file (CLI > environment > file > defaults).",
    },
    OptionGuide {
        flag: "--log-format <fmt>",
        description: "auto, text or json (IMGSHARD_LOG_FORMAT).",
    },
    OptionGuide {
        flag: "--log-level <lvl>",
        description: "error, warn, info, debug or trace (IMGSHARD_LOG_LEVEL).",
    },
];

const TARGETS_OPTION: OptionGuide = OptionGuide {
    flag: "--targets <list>",
    description: "`;`-separated targets: cpu[,+feature...][,base(N)][,clone_all|opt_size|min_size].",
};

const THREADS_OPTION: OptionGuide = OptionGuide {
    flag: "-t, --threads <n>",
    description: "Upper bound on the number of shards.",
};

const COLOCATION_OPTION: OptionGuide = OptionGuide {
    flag: "--colocation <policy>",
    description: "all-references (default) or data-only.",
};

const COMMAND_GUIDES: &[CommandGuide] = &[
    CommandGuide {
        names: &["build", "dump"],
        summary: "Partition, multiversion and compile a module into image archives.",
        usage: &["imgshard build <module.json> [--emit <kinds>] [--out-dir <dir>] [options]"],
        options: &[
            TARGETS_OPTION,
            THREADS_OPTION,
            OptionGuide {
                flag: "--emit <kinds>",
                description: "Comma-separated output kinds: unopt-ir, opt-ir, obj, asm.",
            },
            OptionGuide {
                flag: "--out-dir <dir>",
                description: "Directory receiving image_<kind>.a archives (default: .).",
            },
            OptionGuide {
                flag: "--image-data <file>",
                description: "Payload embedded verbatim as image_data.",
            },
            COLOCATION_OPTION,
            OptionGuide {
                flag: "-O, --opt-level <n>",
                description: "Optimization level passed to the code generator (0-3).",
            },
        ],
        examples: &[
            "imgshard build app.json --emit obj --out-dir build",
            "imgshard build app.json --targets 'generic;haswell,+avx2' --emit obj,asm",
        ],
    },
    CommandGuide {
        names: &["partition", "plan"],
        summary: "Print how a module would be split into shards.",
        usage: &["imgshard partition <module.json> [--threads <n>] [--colocation <policy>]"],
        options: &[THREADS_OPTION, COLOCATION_OPTION],
        examples: &["imgshard partition app.json --threads 4"],
    },
    CommandGuide {
        names: &["annotate"],
        summary: "Print which functions get per-target clones and relocation slots.",
        usage: &["imgshard annotate <module.json> --targets <list>"],
        options: &[TARGETS_OPTION],
        examples: &["imgshard annotate app.json --targets 'generic;skylake,+avx2,+fma,clone_all'"],
    },
    CommandGuide {
        names: &["help"],
        summary: "Show general help or the help of one command.",
        usage: &["imgshard help [command]"],
        options: &[],
        examples: &["imgshard help build"],
    },
    CommandGuide {
        names: &["version"],
        summary: "Print the imgshard version.",
        usage: &["imgshard version"],
        options: &[],
        examples: &[],
    },
];

pub(crate) fn render_general_help() -> String {
    let mut out = String::new();
    out.push_str("imgshard - parallel sharded image builder\n\n");
    out.push_str("USAGE:\n  imgshard <command> [options]\n\n");
    out.push_str("COMMANDS:\n");
    let registry = super::registry();
    for guide in COMMAND_GUIDES {
        let aliases = registry
            .iter()
            .find(|descriptor| descriptor.name() == guide.names[0])
            .map_or(&[][..], |descriptor| descriptor.aliases());
        if aliases.is_empty() {
            let _ = writeln!(out, "  {:11} {}", guide.names[0], guide.summary);
        } else {
            let _ = writeln!(
                out,
                "  {:11} {} (alias: {})",
                guide.names[0],
                guide.summary,
                aliases.join(", ")
            );
        }
    }
    out.push('\n');
    out.push_str("GLOBAL OPTIONS:\n");
    for option in GLOBAL_OPTIONS {
        let _ = writeln!(out, "  {:20} {}", option.flag, option.description);
    }
    out.push('\n');
    out.push_str("Use `imgshard help <command>` to view detailed usage and examples.\n");
    out
}

pub(crate) fn render_command_help(topic: &str) -> Option<String> {
    let guide = find_guide(topic)?;
    let mut out = String::new();
    let _ = writeln!(out, "imgshard {} - {}", guide.names[0], guide.summary);
    out.push('\n');

    out.push_str("USAGE:\n");
    for usage in guide.usage {
        let _ = writeln!(out, "  {usage}");
    }

    if guide.names.len() > 1 {
        out.push('\n');
        out.push_str("ALIASES:\n");
        for alias in &guide.names[1..] {
            let _ = writeln!(out, "  {alias}");
        }
    }

    if !guide.options.is_empty() {
        out.push('\n');
        out.push_str("OPTIONS:\n");
        for option in guide.options {
            let _ = writeln!(out, "  {:24} {}", option.flag, option.description);
        }
    }

    if !guide.examples.is_empty() {
        out.push('\n');
        out.push_str("EXAMPLES:\n");
        for example in guide.examples {
            let _ = writeln!(out, "  {example}");
        }
    }
    Some(out)
}

pub(crate) fn available_topics() -> impl Iterator<Item = &'static str> {
    COMMAND_GUIDES.iter().map(|guide| guide.names[0])
}

pub(crate) fn format_unknown_topic(topic: &str) -> String {
    let mut known = available_topics().collect::<Vec<_>>();
    known.sort_unstable();
    format!(
        "unknown help topic '{topic}'; available commands: {}",
        known.join(", ")
    )
}

fn find_guide(topic: &str) -> Option<&'static CommandGuide> {
    COMMAND_GUIDES.iter().find(|guide| {
        guide
            .names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(topic))
    })
}
