use crate::transport::TransportKind;
use clap::Parser;

/// IPC Channels - uniform message channels over System V queues, AMQP and
/// in-process transports
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// List the System V message queues visible to this user and exit
    #[clap(long, default_value_t = false)]
    pub list_queues: bool,

    /// Remove every System V message queue visible to this user and exit
    #[clap(long, default_value_t = false)]
    pub cleanup: bool,

    /// Print the effective configuration as JSON and exit
    #[clap(long, default_value_t = false)]
    pub show_config: bool,

    /// Transport backend the self test runs over
    #[clap(short = 't', long, value_enum, default_value_t = TransportKind::Memory)]
    pub transport: TransportKind,

    /// Number of messages the self test pushes through the channel
    #[clap(short = 'c', long, default_value_t = crate::defaults::SELF_TEST_COUNT)]
    pub count: usize,

    /// Payload size in bytes for self test messages
    #[clap(short = 's', long, default_value_t = crate::defaults::SELF_TEST_MESSAGE_SIZE)]
    pub message_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["ipc-channels"]).unwrap();
        assert!(!args.list_queues);
        assert!(!args.cleanup);
        assert!(!args.show_config);
        assert_eq!(args.transport, TransportKind::Memory);
        assert_eq!(args.count, crate::defaults::SELF_TEST_COUNT);
        assert_eq!(args.message_size, crate::defaults::SELF_TEST_MESSAGE_SIZE);
    }

    #[test]
    fn test_transport_names() {
        for (name, kind) in [
            ("sysv", TransportKind::SysvQueue),
            ("mem", TransportKind::Memory),
            ("amqp", TransportKind::Amqp),
        ] {
            let args = Args::try_parse_from(["ipc-channels", "--transport", name]).unwrap();
            assert_eq!(args.transport, kind);
        }
    }

    #[test]
    fn test_short_flags() {
        let args =
            Args::try_parse_from(["ipc-channels", "-t", "mem", "-c", "7", "-s", "128"]).unwrap();
        assert_eq!(args.transport, TransportKind::Memory);
        assert_eq!(args.count, 7);
        assert_eq!(args.message_size, 128);
    }

    #[test]
    fn test_unknown_transport_is_rejected() {
        assert!(Args::try_parse_from(["ipc-channels", "--transport", "carrier-pigeon"]).is_err());
    }
}
