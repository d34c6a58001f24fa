pub(crate) mod common;

mod annotate;
mod build;
mod partition;

use super::CommandDescriptor;

const COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "build",
        aliases: &["dump"],
        parser: build::parse,
    },
    CommandDescriptor {
        name: "partition",
        aliases: &["plan"],
        parser: partition::parse,
    },
    CommandDescriptor {
        name: "annotate",
        aliases: &[],
        parser: annotate::parse,
    },
];

pub(crate) fn descriptors() -> &'static [CommandDescriptor] {
    COMMANDS
}
