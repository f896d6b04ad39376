use anyhow::bail;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use plate_scan::{
    api::{ErrorResponse, HealthResponse, PlateStatus, ProcessImageResponse},
    image::{encode_jpeg, sample_plate_image},
};
use reqwest::{Body, Client, multipart};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};
use tokio::fs::File;
use tokio_util::codec::{BytesCodec, FramedRead};

// Simple test client to check a running plate-scan service
#[derive(Parser)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Sends test requests to a plate-scan service")]
struct Args {
    /// Origin for the requests
    #[arg(short, long, default_value = "http://127.0.0.1:8888")]
    origin: String,

    /// Optional image input path, a generated plate image is sent otherwise
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Only check /health
    #[arg(long, default_value_t = false)]
    skip_image: bool,

    /// Number of requests to make
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    number_of_requests: u32,

    /// Interval in milliseconds for making requests
    #[arg(long, default_value_t = 1000)]
    interval: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let origin = reqwest::Url::parse(&args.origin)?;

    let health = check_health(&client, &origin).await?;
    println!("Health: {health:?}");
    if !health.models_loaded {
        println!("Models are not loaded yet, image requests will be rejected");
    }
    if args.skip_image {
        return Ok(());
    }

    let pb = ProgressBar::new(args.number_of_requests as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    println!(
        "Calling {}, {} times with {} ms interval",
        args.origin, args.number_of_requests, args.interval
    );

    let start_time = Instant::now();
    let mut futures = Vec::with_capacity(args.number_of_requests as usize);
    for i in 0..args.number_of_requests {
        futures.push(tokio::task::spawn(send_process_image_request(
            client.clone(),
            origin.clone(),
            args.image.clone(),
        )));
        pb.inc(1);
        if i < args.number_of_requests - 1 {
            tokio::time::sleep(Duration::from_millis(args.interval)).await;
        }
    }
    let results = futures::future::join_all(futures).await;
    pb.finish_with_message("All requests completed!");
    let runtime_duration = start_time.elapsed();

    let mut request_times = Vec::with_capacity(results.len());
    let mut failures = 0;
    let mut last_response = None;
    for result in results {
        match result {
            Ok(Ok((response, request_time))) => {
                request_times.push(request_time);
                last_response = Some(response);
            }
            Ok(Err(err)) => {
                eprintln!("Request failed: {err:#}");
                failures += 1;
            }
            Err(err) => {
                eprintln!("Request task failed: {err}");
                failures += 1;
            }
        }
    }

    if let Some(response) = last_response {
        println!("{response:#?}");
        match response.status {
            PlateStatus::Success => println!(
                "Plate: {} at {:?}",
                response.plate_text.unwrap_or_default(),
                response.bounding_box.unwrap_or_default()
            ),
            PlateStatus::NotDetected => println!("No plate detected"),
        }
    }

    println!("Runtime duration: {runtime_duration:?}");
    if let (Some(min_duration), Some(max_duration)) =
        (request_times.iter().min(), request_times.iter().max())
    {
        let avg_duration = request_times.iter().sum::<Duration>() / request_times.len() as u32;
        println!(
            "Request times -- min: {min_duration:?}, avg: {avg_duration:?}, max: {max_duration:?}"
        );
    } else {
        println!("No request times to summarize");
    }

    if failures > 0 {
        bail!("{failures} of {} requests failed", args.number_of_requests);
    }
    Ok(())
}

async fn check_health(client: &Client, origin: &reqwest::Url) -> anyhow::Result<HealthResponse> {
    let response = client.get(origin.join("health")?).send().await?;
    if !response.status().is_success() {
        bail!("Health check failed with status {}", response.status());
    }
    Ok(response.json::<HealthResponse>().await?)
}

async fn send_process_image_request(
    client: Client,
    origin: reqwest::Url,
    image: Option<PathBuf>,
) -> anyhow::Result<(ProcessImageResponse, Duration)> {
    let url = origin.join("process_image/")?;

    let image_part = if let Some(image) = image {
        let file_name = image
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "image.jpg".to_string());
        let file = File::open(&image).await?;
        let stream = FramedRead::new(file, BytesCodec::new());
        multipart::Part::stream(Body::wrap_stream(stream)).file_name(file_name)
    } else {
        multipart::Part::bytes(encode_jpeg(&sample_plate_image(), 90)?).file_name("plate.jpg")
    }
    .mime_str(mime::APPLICATION_OCTET_STREAM.as_ref())?;

    let form = multipart::Form::new().part("file", image_part);

    let request_start_time = Instant::now();
    let response = client.post(url).multipart(form).send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = match response.json::<ErrorResponse>().await {
            Ok(error) => error.detail,
            Err(err) => format!("<unreadable body: {err}>"),
        };
        bail!("Request failed with status {status}: {detail}");
    }
    let response = response.json::<ProcessImageResponse>().await?;

    Ok((response, request_start_time.elapsed()))
}
