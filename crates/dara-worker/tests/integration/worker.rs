use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

use dara_service::pool::Value;
use dara_service::pool::messages::{TaskPayload, WorkerCommand, WorkerMessage};
use dara_service::pool::shm::SharedMemory;
use dara_service::pool::worker::{ENV_SHM_DIR, ENV_TASK_MODULE};

use crate::test;

/// Runs tasks on a worker speaking the protocol directly, without a pool in between.
#[test]
fn test_printed_lines_precede_result() {
    test::setup();
    let shm_dir = test::tempdir();
    let shm = SharedMemory::new(shm_dir.path(), 1 << 20);

    let mut worker = Command::new(env!("CARGO_BIN_EXE_dara-worker"))
        .env(ENV_TASK_MODULE, "builtin")
        .env(ENV_SHM_DIR, shm_dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let mut commands = worker.stdin.take().unwrap();
    let mut lines = BufReader::new(worker.stdout.take().unwrap()).lines();
    let mut next_message = || -> WorkerMessage {
        let line = lines.next().unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    };
    assert_eq!(next_message(), WorkerMessage::Initialization);

    for task in 0..10 {
        let task_id = format!("t{task}");
        let args = (0..50)
            .map(|i| Value::from(format!("{task_id} line {i}")))
            .collect();
        let payload = shm
            .write(&TaskPayload {
                function_name: "print".into(),
                args,
                kwargs: BTreeMap::new(),
            })
            .unwrap();
        let command = WorkerCommand::Task {
            task_id: task_id.clone(),
            payload,
        };
        writeln!(commands, "{}", serde_json::to_string(&command).unwrap()).unwrap();

        let mut logged = 0;
        loop {
            match next_message() {
                WorkerMessage::Acknowledgement { task_id: acked } => assert_eq!(acked, task_id),
                WorkerMessage::Log {
                    task_id: tagged,
                    message,
                } => {
                    assert_eq!(tagged.as_deref(), Some(task_id.as_str()));
                    assert_eq!(message, format!("{task_id} line {logged}"));
                    logged += 1;
                }
                WorkerMessage::Result {
                    task_id: done,
                    result,
                } => {
                    assert_eq!(done, task_id);
                    assert_eq!(shm.read::<Value>(&result), Ok(Value::Int(50)));
                    break;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(logged, 50);
    }

    drop(commands);
    assert!(worker.wait().unwrap().success());
}
