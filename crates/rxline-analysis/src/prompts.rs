/*
 * RxLine - Prescription analysis dispatch service
 * Copyright (C) 2025–2026 RxLine Contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Prompt constants sent to the completion provider, and the fixed
//! degraded-service texts. The pharmacology prompt directs the model to
//! answer in tagged Persian sections that the client renders structurally;
//! every prompt variant shares the same section guide.

/// Tagged response sections shared by every prescription prompt variant.
const SECTION_GUIDE: &str = "<داروها>
لیست کامل داروها را بنویس و برای هر دارو یک توضیح کامل بنویس که شامل دسته دارویی، مکانیسم اثر و کاربرد اصلی آن باشد. حتما همه داروهای موجود در نسخه را بررسی کن و هیچ دارویی را از قلم نینداز.
</داروها>

<تشخیص>
با توجه به ترکیب داروها، تشخیص احتمالی را با جزئیات کامل توضیح بده و دلیل استفاده از هر دارو را در درمان این عارضه شرح بده.
</تشخیص>

<تداخلات>
تمام تداخلات بین داروهای نسخه را با جزئیات بررسی کن. برای هر تداخل، شدت آن، مکانیسم تداخل و راهکارهای مدیریت آن را توضیح بده. اگر تداخل مهمی وجود ندارد، به صراحت ذکر کن.
</تداخلات>

<عوارض>
عوارض شایع و مهم هر دارو را به تفکیک بنویس و توضیح بده که بیمار چگونه باید این عوارض را مدیریت کند. عوارض خطرناک که نیاز به مراجعه فوری به پزشک دارند را مشخص کن.
</عوارض>

<زمان_مصرف>
برای هر دارو، بهترین زمان مصرف را با دلیل آن توضیح بده. مثلا صبح، شب، قبل از خواب، یا در زمان‌های خاص دیگر.
</زمان_مصرف>

<مصرف_با_غذا>
برای هر دارو مشخص کن که آیا باید با غذا، با معده خالی، یا با فاصله از غذا مصرف شود و دلیل این توصیه را توضیح بده.
</مصرف_با_غذا>

<دوز_مصرف>
دوز و تعداد دفعات مصرف هر دارو را به صورت دقیق بنویس و در صورت نیاز، توضیح بده که چرا این دوز توصیه شده است.
</دوز_مصرف>

<مدیریت_عارضه>
توصیه‌های تکمیلی برای مدیریت بیماری یا عارضه را بنویس، مانند رژیم غذایی خاص، فعالیت‌های فیزیکی توصیه شده یا منع شده، و سایر نکات مهم برای بهبود اثربخشی درمان.
</مدیریت_عارضه>";

/// System prompt for text prescriptions.
#[must_use]
pub fn prescription_system_prompt() -> String {
    format!(
        "من مسئول فنی یک داروخانه شهری هستم

خوب فکر کن و تمام جوانب رو بررسی کن و با استدلال جواب بده

و به این شکل به من در مورد این نسخه جواب بده:

با سلام همکار گرامی،

با بررسی داروهای موجود در نسخه، اطلاعات زیر را خدمت شما ارائه می‌دهم:

{SECTION_GUIDE}"
    )
}

/// System prompt for the multimodal tier, where the prescription arrives as
/// an attached image rather than inline text.
#[must_use]
pub fn vision_system_prompt() -> String {
    format!(
        "من مسئول فنی یک داروخانه شهری هستم. لطفا تصویر نسخه ارسالی را تحلیل کن و به صورت ساختار یافته پاسخ بده. پاسخ باید شامل این بخش‌ها باشد:

{SECTION_GUIDE}"
    )
}

/// User text accompanying the attached image on the multimodal tier.
pub const VISION_USER_TEXT: &str = "لطفا این نسخه تصویری را تحلیل کنید:";

/// Text-only prompt that embeds the image URL, for providers or tiers that
/// cannot accept image input.
#[must_use]
pub fn image_url_prompt(image_url: &str) -> String {
    format!(
        "من مسئول فنی یک داروخانه شهری هستم

خوب فکر کن و تمام جوانب رو بررسی کن و با استدلال جواب بده

به این نسخه تصویری نگاه کن و به من کمک کن. تصویر نسخه در این آدرس قابل مشاهده است: {image_url}

با سلام همکار گرامی،

با بررسی داروهای موجود در نسخه، اطلاعات زیر را خدمت شما ارائه می‌دهم:

{SECTION_GUIDE}"
    )
}

// ---------------------------------------------------------------------------
// Degraded-service texts
// ---------------------------------------------------------------------------

/// Returned when every tier fails for a text prescription.
pub const DEGRADED_PRESCRIPTION: &str =
    "عذر می‌خواهم، در تحلیل این نسخه خطایی رخ داد. لطفا دوباره تلاش کنید.";

/// Returned when every tier fails for an image prescription.
pub const DEGRADED_IMAGE: &str =
    "عذر می‌خواهم، در تحلیل این نسخه تصویری خطایی رخ داد. لطفا دوباره تلاش کنید یا نسخه را به صورت متنی وارد کنید.";

/// Returned when every tier fails for a plain completion.
pub const DEGRADED_COMPLETION: &str = "Error generating completion. Please try again later.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_variant_carries_the_section_guide() {
        for prompt in [
            prescription_system_prompt(),
            vision_system_prompt(),
            image_url_prompt("https://img.test/rx.jpg"),
        ] {
            assert!(prompt.contains("<داروها>"));
            assert!(prompt.contains("</مدیریت_عارضه>"));
        }
    }

    #[test]
    fn test_image_url_prompt_embeds_url() {
        let prompt = image_url_prompt("https://img.test/rx-42.png");
        assert!(prompt.contains("https://img.test/rx-42.png"));
    }

    #[test]
    fn test_degraded_texts_are_non_empty_and_distinct() {
        assert!(!DEGRADED_PRESCRIPTION.is_empty());
        assert!(!DEGRADED_IMAGE.is_empty());
        assert!(!DEGRADED_COMPLETION.is_empty());
        assert_ne!(DEGRADED_PRESCRIPTION, DEGRADED_IMAGE);
    }
}
