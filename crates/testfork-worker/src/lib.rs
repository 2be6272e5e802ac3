// testfork-worker: the process forked by the dispatcher to run test classes.
// Depends on `testfork-sdk` and `testfork-common`.
//
// Architecture:
//   main → Worker::run_async → (per ProcessTestClass request)
//     TestClassExecutor::execute → ProcessInvoker; events flow back over
//     the process channel.

pub mod test_class_executor;
pub mod worker;
