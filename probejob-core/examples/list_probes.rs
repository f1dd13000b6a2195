use probejob_core::{Dispatcher, DispatcherConfig, Job, OutputValue, ProbeRsConfig, ProbeRsDriver};

fn main() {
    env_logger::init();
    let mut dispatcher = Dispatcher::new(ProbeRsDriver::new(ProbeRsConfig::default()), DispatcherConfig::default());

    match dispatcher.run(Job::connected_devices()) {
        Ok(response) => {
            let Some(OutputValue::Probes(probes)) = response.values.first() else {
                return;
            };
            println!("Found {} probes:", probes.len());
            for (i, probe) in probes.iter().enumerate() {
                println!("{}: {} (Serial: {})", i, probe.name(), probe.serial_number);
            }
        }
        Err(e) => eprintln!("{e}"),
    }
}
