mod common;

mod conservation_tests;
mod gateway_tests;
mod journal_tests;
mod processor_tests;
mod recovery_tests;
mod structures_tests;
mod tokio_gateway_tests;
